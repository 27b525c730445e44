//! PES packet header parsing shared by the PS and TS engines.
//!
//! Covers the MPEG-2 optional header (`'10'` marker) and the MPEG-1 header
//! used by some older program streams. Timestamps are 33-bit, 90 kHz.

/// Stream ids whose PES packets carry no optional header.
const NO_HEADER_IDS: [u8; 7] = [0xBC, 0xBE, 0xBF, 0xF0, 0xF1, 0xF2, 0xF8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesHeader {
    pub stream_id: u8,
    /// `PES_packet_length`; 0 means unbounded (TS video only).
    pub packet_length: usize,
    /// Bytes from the start code to the first payload byte.
    pub header_len: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
}

impl PesHeader {
    /// Total packet size including the 6-byte prefix, when bounded.
    pub fn total_len(&self) -> Option<usize> {
        (self.packet_length != 0).then_some(6 + self.packet_length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PesParse {
    Header(PesHeader),
    /// More bytes are needed to read the header.
    Incomplete,
    /// Not a PES header.
    Invalid,
}

pub fn is_video_stream(stream_id: u8) -> bool {
    (0xE0..=0xEF).contains(&stream_id)
}

pub fn is_audio_stream(stream_id: u8) -> bool {
    (0xC0..=0xDF).contains(&stream_id)
}

/// Private stream 1, used by some encoders for G.711 / AAC.
pub fn is_private_stream(stream_id: u8) -> bool {
    stream_id == 0xBD
}

pub fn parse_header(data: &[u8]) -> PesParse {
    if data.len() < 6 {
        return PesParse::Incomplete;
    }
    if data[..3] != [0, 0, 1] {
        return PesParse::Invalid;
    }
    let stream_id = data[3];
    let packet_length = u16::from_be_bytes([data[4], data[5]]) as usize;

    if NO_HEADER_IDS.contains(&stream_id) {
        return PesParse::Header(PesHeader {
            stream_id,
            packet_length,
            header_len: 6,
            pts: None,
            dts: None,
        });
    }

    let Some(&marker) = data.get(6) else {
        return PesParse::Incomplete;
    };
    let parsed = if marker & 0xC0 == 0x80 {
        parse_mpeg2(data)
    } else {
        parse_mpeg1(data)
    };
    match parsed {
        Ok((header_len, pts, dts)) => {
            if packet_length != 0 && header_len > 6 + packet_length {
                return PesParse::Invalid;
            }
            PesParse::Header(PesHeader {
                stream_id,
                packet_length,
                header_len,
                pts,
                dts,
            })
        }
        Err(e) => e,
    }
}

type Parsed = Result<(usize, Option<i64>, Option<i64>), PesParse>;

fn parse_mpeg2(data: &[u8]) -> Parsed {
    if data.len() < 9 {
        return Err(PesParse::Incomplete);
    }
    let pts_dts_flags = data[7] >> 6;
    let header_len = 9 + data[8] as usize;
    if data.len() < header_len {
        return Err(PesParse::Incomplete);
    }
    let (pts, dts) = match pts_dts_flags {
        0b10 if header_len >= 14 => (Some(read_timestamp(&data[9..14])), None),
        0b11 if header_len >= 19 => (
            Some(read_timestamp(&data[9..14])),
            Some(read_timestamp(&data[14..19])),
        ),
        0b00 => (None, None),
        _ => return Err(PesParse::Invalid),
    };
    Ok((header_len, pts, dts))
}

fn parse_mpeg1(data: &[u8]) -> Parsed {
    let mut pos = 6;
    // Up to 16 stuffing bytes.
    while data.get(pos) == Some(&0xFF) {
        pos += 1;
        if pos > 6 + 16 {
            return Err(PesParse::Invalid);
        }
    }
    let Some(&b) = data.get(pos) else {
        return Err(PesParse::Incomplete);
    };
    if b & 0xC0 == 0x40 {
        // STD buffer scale/size
        pos += 2;
    }
    let Some(&b) = data.get(pos) else {
        return Err(PesParse::Incomplete);
    };
    let (len, pts, dts) = match b >> 4 {
        0b0010 => match data.get(pos..pos + 5) {
            Some(ts) => (5, Some(read_timestamp(ts)), None),
            None => return Err(PesParse::Incomplete),
        },
        0b0011 => match data.get(pos..pos + 10) {
            Some(ts) => (10, Some(read_timestamp(&ts[..5])), Some(read_timestamp(&ts[5..]))),
            None => return Err(PesParse::Incomplete),
        },
        _ if b == 0x0F => (1, None, None),
        _ => return Err(PesParse::Invalid),
    };
    Ok((pos + len, pts, dts))
}

/// Decode a 5-byte PTS/DTS field.
pub fn read_timestamp(b: &[u8]) -> i64 {
    (((b[0] as i64 >> 1) & 0x07) << 30)
        | ((b[1] as i64) << 22)
        | ((b[2] as i64 >> 1) << 15)
        | ((b[3] as i64) << 7)
        | (b[4] as i64 >> 1)
}

/// Per-stream timestamp carry: PES packets without PTS inherit the last
/// one seen on the same stream; DTS defaults to PTS.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampCarry {
    last: Option<(i64, i64)>,
}

impl TimestampCarry {
    /// Returns `(pts, dts)`.
    pub fn resolve(&mut self, header: &PesHeader) -> (i64, i64) {
        match header.pts {
            Some(pts) => {
                let dts = header.dts.unwrap_or(pts);
                self.last = Some((pts, dts));
                (pts, dts)
            }
            None => self.last.unwrap_or((0, 0)),
        }
    }
}
