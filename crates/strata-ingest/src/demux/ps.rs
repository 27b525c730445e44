//! # Program Stream Engine
//!
//! Streaming MPEG-2 PS parser (ISO/IEC 13818-1 §2.5). Walks start codes,
//! records the program stream map, and emits one [`DecodedUnit`] per
//! audio/video PES packet. Everything else is skipped by length.
//!
//! ```text
//! 00 00 01 BA  pack header     (MPEG-2: 14 + stuffing, MPEG-1: 12)
//! 00 00 01 BB  system header   (length prefixed)
//! 00 00 01 BC  stream map      (length prefixed, es_id → stream_type)
//! 00 00 01 xx  PES packet      (length prefixed, xx ≥ 0xBD)
//! 00 00 01 B9  program end
//! ```

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

use super::pes::{self, PesParse, TimestampCarry};
use super::{ContainerFormat, DecodeCallback, DecodedUnit, DemuxEngine};
use crate::codec::CodecId;

const PACK_START: u8 = 0xBA;
const PROGRAM_END: u8 = 0xB9;
const SYSTEM_HEADER: u8 = 0xBB;
const STREAM_MAP: u8 = 0xBC;
const FIRST_PES_ID: u8 = 0xBD;

/// What the bytes at the head of the buffer are.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    NeedMore,
    /// Not at a start code; drop this many bytes.
    Skip(usize),
    /// Structure we only need to step over.
    Structure(usize),
    Map(usize),
    Pes(usize),
}

pub struct PsDemuxer {
    buf: BytesMut,
    stream_types: HashMap<u8, CodecId>,
    carries: HashMap<u8, TimestampCarry>,
    on_decode: DecodeCallback,
}

impl PsDemuxer {
    pub fn new(on_decode: DecodeCallback) -> Self {
        Self {
            buf: BytesMut::new(),
            stream_types: HashMap::new(),
            carries: HashMap::new(),
            on_decode,
        }
    }

    /// Stream type for a PES stream id: from the map when one was seen,
    /// otherwise H.264 for video and nothing for audio.
    fn codec_for(&self, stream_id: u8) -> CodecId {
        match self.stream_types.get(&stream_id) {
            Some(&codec) => codec,
            None if pes::is_video_stream(stream_id) => CodecId::VIDEO_H264,
            None => CodecId::NONE,
        }
    }

    fn parse_map(&mut self, pkt: &[u8]) {
        // start code(4) + length(2) + flags(2) + info length(2)
        if pkt.len() < 10 {
            return;
        }
        let info_len = u16::from_be_bytes([pkt[8], pkt[9]]) as usize;
        let mut pos = 10 + info_len;
        let Some(len_bytes) = pkt.get(pos..pos + 2) else {
            return;
        };
        let map_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        pos += 2;
        let end = (pos + map_len).min(pkt.len().saturating_sub(4));
        while pos + 4 <= end {
            let codec = CodecId(pkt[pos]);
            let es_id = pkt[pos + 1];
            let es_info_len = u16::from_be_bytes([pkt[pos + 2], pkt[pos + 3]]) as usize;
            if self.stream_types.insert(es_id, codec) != Some(codec) {
                debug!(es_id = format_args!("{es_id:#04x}"), %codec, "PS stream mapped");
            }
            pos += 4 + es_info_len;
        }
    }

    fn handle_pes(&mut self, pkt: Bytes) {
        let stream_id = pkt[3];
        if !(pes::is_video_stream(stream_id)
            || pes::is_audio_stream(stream_id)
            || pes::is_private_stream(stream_id))
        {
            return;
        }
        let header = match pes::parse_header(&pkt) {
            PesParse::Header(h) => h,
            other => {
                debug!(stream_id, ?other, "malformed PES header");
                return;
            }
        };
        if header.header_len >= pkt.len() {
            return;
        }
        let codec = self.codec_for(stream_id);
        let (pts, dts) = self.carries.entry(stream_id).or_default().resolve(&header);
        let payload = pkt.slice(header.header_len..);
        (self.on_decode)(DecodedUnit::new(stream_id as u16, codec, pts, dts, payload));
    }
}

impl DemuxEngine for PsDemuxer {
    fn input(&mut self, data: &[u8]) -> usize {
        self.buf.extend_from_slice(data);
        let mut skipped = 0usize;
        loop {
            match next_step(&self.buf) {
                Step::NeedMore => break,
                Step::Skip(n) => {
                    self.buf.advance(n);
                    skipped += n;
                }
                Step::Structure(n) => self.buf.advance(n),
                Step::Map(n) => {
                    let pkt = self.buf.split_to(n).freeze();
                    self.parse_map(&pkt);
                }
                Step::Pes(n) => {
                    let pkt = self.buf.split_to(n).freeze();
                    self.handle_pes(pkt);
                }
            }
        }
        if skipped > 0 {
            debug!(skipped, buffered = self.buf.len(), "PS resync");
        }
        data.len().saturating_sub(skipped)
    }

    fn format(&self) -> ContainerFormat {
        ContainerFormat::Ps
    }
}

fn next_step(b: &[u8]) -> Step {
    if b.len() < 4 {
        return Step::NeedMore;
    }
    if b[..3] != [0, 0, 1] {
        return match b[1..].windows(3).position(|w| w == [0, 0, 1]) {
            Some(p) => Step::Skip(p + 1),
            // Keep a possible partial prefix.
            None => Step::Skip(b.len() - 2),
        };
    }
    match b[3] {
        PACK_START => pack_header(b),
        PROGRAM_END => Step::Structure(4),
        SYSTEM_HEADER => length_prefixed(b, Step::Structure),
        STREAM_MAP => length_prefixed(b, Step::Map),
        id if id >= FIRST_PES_ID => length_prefixed(b, Step::Pes),
        // Elementary-stream start codes are not valid at PS level.
        _ => Step::Skip(3),
    }
}

fn pack_header(b: &[u8]) -> Step {
    let Some(&b4) = b.get(4) else {
        return Step::NeedMore;
    };
    let total = if b4 & 0xC0 == 0x40 {
        let Some(&b13) = b.get(13) else {
            return Step::NeedMore;
        };
        14 + (b13 & 0x07) as usize
    } else if b4 & 0xF0 == 0x20 {
        12
    } else {
        return Step::Skip(4);
    };
    if b.len() < total {
        Step::NeedMore
    } else {
        Step::Structure(total)
    }
}

fn length_prefixed(b: &[u8], step: fn(usize) -> Step) -> Step {
    if b.len() < 6 {
        return Step::NeedMore;
    }
    let total = 6 + u16::from_be_bytes([b[4], b[5]]) as usize;
    if b.len() < total {
        Step::NeedMore
    } else {
        step(total)
    }
}
