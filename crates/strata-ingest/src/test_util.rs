//! # Test Stream Builders
//!
//! Byte-level builders for RTP packets and minimal PS / TS multiplexes.
//! Used by unit tests, the integration tests under `tests/`, and anyone
//! wanting to drive an [`crate::process::RtpProcess`] without a camera.
//!
//! Timestamps passed to the muxers are milliseconds; they are written to
//! the bitstream in 90 kHz units.

use std::collections::HashMap;

use crate::demux::sniff::{TS_PACKET_SIZE, TS_SYNC_BYTE};

// ─── RTP ─────────────────────────────────────────────────────────────────────

/// Builds a single RTP packet.
#[derive(Debug, Clone)]
pub struct RtpBuilder {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    marker: bool,
    payload_type: u8,
}

impl RtpBuilder {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            sequence: 0,
            timestamp: 0,
            marker: false,
            payload_type: 96,
        }
    }

    pub fn sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    pub fn payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + payload.len());
        out.push(0x80);
        out.push((u8::from(self.marker) << 7) | (self.payload_type & 0x7F));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

/// Splits container chunks into RTP packets with running sequence numbers.
/// The last packet of every chunk carries the marker bit.
#[derive(Debug, Clone)]
pub struct RtpPacketizer {
    ssrc: u32,
    next_seq: u16,
    max_payload: usize,
}

impl RtpPacketizer {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            next_seq: 0,
            max_payload: 1400,
        }
    }

    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.max(1);
        self
    }

    /// Skip `n` sequence numbers, simulating loss.
    pub fn skip(&mut self, n: u16) {
        self.next_seq = self.next_seq.wrapping_add(n);
    }

    pub fn packetize(&mut self, timestamp: u32, chunk: &[u8]) -> Vec<Vec<u8>> {
        let pieces: Vec<&[u8]> = chunk.chunks(self.max_payload).collect();
        let count = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, piece)| {
                let seq = self.next_seq;
                self.next_seq = self.next_seq.wrapping_add(1);
                RtpBuilder::new(self.ssrc)
                    .sequence(seq)
                    .timestamp(timestamp)
                    .marker(i + 1 == count)
                    .build(piece)
            })
            .collect()
    }
}

// ─── PES ─────────────────────────────────────────────────────────────────────

/// Write a 33-bit timestamp in PES syntax with the given 4-bit prefix.
pub fn encode_timestamp(out: &mut [u8], prefix: u8, ts: i64) {
    let ts = ts as u64;
    out[0] = (prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1;
    out[1] = (ts >> 22) as u8;
    out[2] = ((((ts >> 15) & 0x7F) as u8) << 1) | 1;
    out[3] = (ts >> 7) as u8;
    out[4] = (((ts & 0x7F) as u8) << 1) | 1;
}

/// A PES packet with an MPEG-2 header. `unbounded` writes a zero
/// `PES_packet_length`, as TS video streams do.
pub fn pes_packet(
    stream_id: u8,
    pts: Option<i64>,
    dts: Option<i64>,
    payload: &[u8],
    unbounded: bool,
) -> Vec<u8> {
    let mut opt = Vec::with_capacity(10);
    let flags = match (pts, dts) {
        (Some(pts), Some(dts)) => {
            let mut b = [0u8; 10];
            encode_timestamp(&mut b[..5], 0b0011, pts);
            encode_timestamp(&mut b[5..], 0b0001, dts);
            opt.extend_from_slice(&b);
            0xC0
        }
        (Some(pts), None) => {
            let mut b = [0u8; 5];
            encode_timestamp(&mut b, 0b0010, pts);
            opt.extend_from_slice(&b);
            0x80
        }
        _ => 0x00,
    };
    let length = if unbounded {
        0
    } else {
        3 + opt.len() + payload.len()
    };
    let mut out = Vec::with_capacity(9 + opt.len() + payload.len());
    out.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    out.extend_from_slice(&(length as u16).to_be_bytes());
    out.extend_from_slice(&[0x80, flags, opt.len() as u8]);
    out.extend_from_slice(&opt);
    out.extend_from_slice(payload);
    out
}

// ─── Program Stream ──────────────────────────────────────────────────────────

/// MPEG-2 pack header with no stuffing.
pub fn ps_pack_header(scr: u64) -> Vec<u8> {
    vec![
        0x00,
        0x00,
        0x01,
        0xBA,
        0x44 | (((scr >> 27) & 0x38) as u8) | (((scr >> 28) & 0x03) as u8),
        (scr >> 20) as u8,
        (((scr >> 12) & 0xF8) as u8) | 0x04 | (((scr >> 13) & 0x03) as u8),
        (scr >> 5) as u8,
        (((scr << 3) & 0xF8) as u8) | 0x04,
        0x01,
        0x01,
        0x89,
        0xC3,
        0xF8,
    ]
}

pub fn ps_system_header() -> Vec<u8> {
    vec![
        0x00, 0x00, 0x01, 0xBB, 0x00, 0x0C, 0x80, 0xC4, 0xE1, 0x04, 0xE1, 0x7F, 0xE0, 0xE0,
        0xE8, 0xC0, 0xC0, 0x20,
    ]
}

/// Program stream map for `(stream_type, es_id)` entries.
pub fn ps_map(entries: &[(u8, u8)]) -> Vec<u8> {
    let es_map_len = entries.len() * 4;
    let length = 2 + 2 + 2 + es_map_len + 4;
    let mut out = vec![0x00, 0x00, 0x01, 0xBC];
    out.extend_from_slice(&(length as u16).to_be_bytes());
    out.extend_from_slice(&[0xE0, 0xFF, 0x00, 0x00]);
    out.extend_from_slice(&(es_map_len as u16).to_be_bytes());
    for &(stream_type, es_id) in entries {
        out.extend_from_slice(&[stream_type, es_id, 0x00, 0x00]);
    }
    let crc = crc32_mpeg2(&out[6..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// Minimal PS multiplexer: one video stream on 0xE0, one audio on 0xC0.
/// The stream map is written ahead of the first video frame.
#[derive(Debug, Clone, Default)]
pub struct PsMuxer {
    video: Option<u8>,
    audio: Option<u8>,
    map_sent: bool,
    omit_map: bool,
}

impl PsMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn video(mut self, stream_type: u8) -> Self {
        self.video = Some(stream_type);
        self
    }

    pub fn audio(mut self, stream_type: u8) -> Self {
        self.audio = Some(stream_type);
        self
    }

    /// Never write a program stream map.
    pub fn without_map(mut self) -> Self {
        self.omit_map = true;
        self
    }

    pub fn video_frame(&mut self, dts_ms: u32, pts_ms: u32, es: &[u8]) -> Vec<u8> {
        let mut out = ps_pack_header(dts_ms as u64 * 90);
        self.write_map(&mut out);
        out.extend(pes_packet(
            0xE0,
            Some(pts_ms as i64 * 90),
            Some(dts_ms as i64 * 90),
            es,
            false,
        ));
        out
    }

    pub fn audio_frame(&mut self, pts_ms: u32, es: &[u8]) -> Vec<u8> {
        let mut out = ps_pack_header(pts_ms as u64 * 90);
        self.write_map(&mut out);
        out.extend(pes_packet(0xC0, Some(pts_ms as i64 * 90), None, es, false));
        out
    }

    fn write_map(&mut self, out: &mut Vec<u8>) {
        if self.map_sent || self.omit_map {
            return;
        }
        let mut entries = Vec::new();
        if let Some(st) = self.video {
            entries.push((st, 0xE0));
        }
        if let Some(st) = self.audio {
            entries.push((st, 0xC0));
        }
        out.extend(ps_system_header());
        out.extend(ps_map(&entries));
        self.map_sent = true;
    }
}

// ─── Transport Stream ────────────────────────────────────────────────────────

pub const TS_PMT_PID: u16 = 0x1000;
pub const TS_VIDEO_PID: u16 = 0x0100;
pub const TS_AUDIO_PID: u16 = 0x0101;

/// Minimal TS multiplexer: PAT, one PMT, one video and one audio pid.
#[derive(Debug, Clone, Default)]
pub struct TsMuxer {
    video: Option<u8>,
    audio: Option<u8>,
    continuity: HashMap<u16, u8>,
}

impl TsMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn video(mut self, stream_type: u8) -> Self {
        self.video = Some(stream_type);
        self
    }

    pub fn audio(mut self, stream_type: u8) -> Self {
        self.audio = Some(stream_type);
        self
    }

    /// PAT followed by PMT: two packets.
    pub fn tables(&mut self) -> Vec<u8> {
        let mut pat = vec![0x00, 0x01, 0xC1, 0x00, 0x00];
        pat.extend_from_slice(&[0x00, 0x01]);
        pat.extend_from_slice(&(0xE000 | TS_PMT_PID).to_be_bytes());
        let mut out = self.section_packet(0, 0x00, &pat);

        let pcr_pid = if self.video.is_some() {
            TS_VIDEO_PID
        } else {
            TS_AUDIO_PID
        };
        let mut pmt = vec![0x00, 0x01, 0xC1, 0x00, 0x00];
        pmt.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
        pmt.extend_from_slice(&[0xF0, 0x00]);
        for (stream_type, pid) in [(self.video, TS_VIDEO_PID), (self.audio, TS_AUDIO_PID)] {
            if let Some(st) = stream_type {
                pmt.push(st);
                pmt.extend_from_slice(&(0xE000 | pid).to_be_bytes());
                pmt.extend_from_slice(&[0xF0, 0x00]);
            }
        }
        out.extend(self.section_packet(TS_PMT_PID, 0x02, &pmt));
        out
    }

    pub fn video_frame(&mut self, dts_ms: u32, pts_ms: u32, es: &[u8]) -> Vec<u8> {
        let pes = pes_packet(
            0xE0,
            Some(pts_ms as i64 * 90),
            Some(dts_ms as i64 * 90),
            es,
            true,
        );
        self.pes_packets(TS_VIDEO_PID, &pes)
    }

    pub fn audio_frame(&mut self, pts_ms: u32, es: &[u8]) -> Vec<u8> {
        let pes = pes_packet(0xC0, Some(pts_ms as i64 * 90), None, es, false);
        self.pes_packets(TS_AUDIO_PID, &pes)
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0x0F);
        *cc = (*cc + 1) & 0x0F;
        *cc
    }

    fn section_packet(&mut self, pid: u16, table_id: u8, body: &[u8]) -> Vec<u8> {
        let section_length = body.len() + 4;
        let mut section = vec![
            table_id,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            section_length as u8,
        ];
        section.extend_from_slice(body);
        let crc = crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());

        let cc = self.next_cc(pid);
        let mut pkt = vec![TS_SYNC_BYTE, 0x40 | (pid >> 8) as u8, pid as u8, 0x10 | cc, 0x00];
        pkt.extend_from_slice(&section);
        pkt.resize(TS_PACKET_SIZE, 0xFF);
        pkt
    }

    fn pes_packets(&mut self, pid: u16, pes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut rest = pes;
        let mut first = true;
        while !rest.is_empty() {
            let take = rest.len().min(TS_PACKET_SIZE - 4);
            let cc = self.next_cc(pid);
            let pusi = if first { 0x40 } else { 0x00 };
            if take == TS_PACKET_SIZE - 4 {
                out.extend_from_slice(&[TS_SYNC_BYTE, pusi | (pid >> 8) as u8, pid as u8, 0x10 | cc]);
            } else {
                // Pad the last packet with adaptation-field stuffing.
                let af_len = TS_PACKET_SIZE - 5 - take;
                out.extend_from_slice(&[TS_SYNC_BYTE, pusi | (pid >> 8) as u8, pid as u8, 0x30 | cc]);
                out.push(af_len as u8);
                if af_len > 0 {
                    out.push(0x00);
                    out.extend(std::iter::repeat(0xFF).take(af_len - 1));
                }
            }
            out.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            first = false;
        }
        out
    }
}

/// CRC-32/MPEG-2 as used by PSI sections and the program stream map.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

// ─── Elementary streams ──────────────────────────────────────────────────────

/// Annex B H.264 access unit: SPS, PPS and an IDR slice.
pub fn h264_keyframe(fill: u8, len: usize) -> Vec<u8> {
    let mut out = vec![
        0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // SPS
        0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x38, 0x80, // PPS
        0x00, 0x00, 0x00, 0x01, 0x65, // IDR
    ];
    out.extend(std::iter::repeat(fill).take(len));
    out
}

/// Annex B H.264 non-IDR slice.
pub fn h264_slice(fill: u8, len: usize) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00, 0x01, 0x41];
    out.extend(std::iter::repeat(fill).take(len));
    out
}

/// ADTS-framed AAC payload of `len` bytes after the 7-byte header.
pub fn adts_frame(len: usize) -> Vec<u8> {
    let frame_len = 7 + len;
    let mut out = vec![
        0xFF,
        0xF1,
        0x50,
        0x80 | ((frame_len >> 11) as u8 & 0x03),
        (frame_len >> 3) as u8,
        (((frame_len & 0x07) as u8) << 5) | 0x1F,
        0xFC,
    ];
    out.extend(std::iter::repeat(0x21).take(len));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_known_pat() {
        // Reference PAT section from a real capture: program 1 → PMT 0x1000.
        let section = [0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00];
        assert_eq!(crc32_mpeg2(&section), 0x2AB1_04B2);
    }

    #[test]
    fn ts_muxer_emits_whole_packets() {
        let mut mux = TsMuxer::new().video(0x1B);
        let tables = mux.tables();
        assert_eq!(tables.len(), 2 * TS_PACKET_SIZE);
        let frame = mux.video_frame(40, 40, &h264_keyframe(0xAB, 500));
        assert_eq!(frame.len() % TS_PACKET_SIZE, 0);
        assert!(frame.chunks(TS_PACKET_SIZE).all(|p| p[0] == TS_SYNC_BYTE));
    }

    #[test]
    fn packetizer_marks_last_packet() {
        let mut rtp = RtpPacketizer::new(7).max_payload(10);
        let pkts = rtp.packetize(3000, &[0u8; 25]);
        assert_eq!(pkts.len(), 3);
        assert_eq!(pkts[0][1] & 0x80, 0);
        assert_eq!(pkts[2][1] & 0x80, 0x80);
        assert_eq!(u16::from_be_bytes([pkts[2][2], pkts[2][3]]), 2);
    }
}
