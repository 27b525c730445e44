//! # RTP Packet Handling
//!
//! Parsing of the RTP fixed header (RFC 3550 §5.1), sequence continuity
//! monitoring, and reassembly of MP2P/MP2T payloads into container chunks.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |                    CSRC list (CC × 32 bits)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

// ─── Constants ───────────────────────────────────────────────────────────────

/// RTP protocol version.
pub const RTP_VERSION: u8 = 2;

/// Fixed header size without CSRCs.
pub const RTP_HEADER_LEN: usize = 12;

/// Size of the RTSP interleaved frame prefix: `$`, channel, u16 length.
pub const INTERLEAVED_PREFIX_LEN: usize = 4;

const INTERLEAVED_MAGIC: u8 = b'$';

/// Largest chunk the assembler collects before handing it on, whether or
/// not the timestamp changed or a marker arrived.
pub const MAX_CHUNK_SIZE: usize = 2 * 1024 * 1024;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RtpError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported RTP version {0}")]
    BadVersion(u8),
    #[error("CSRC list or header extension exceeds packet")]
    Truncated,
    #[error("invalid padding length {0}")]
    BadPadding(u8),
}

// ─── Packet ──────────────────────────────────────────────────────────────────

/// A parsed RTP packet borrowing its payload from the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Payload with CSRCs, header extension and padding removed.
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, RtpError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(RtpError::TooShort(data.len()));
        }
        let mut buf = data;
        let b0 = buf.get_u8();
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::BadVersion(version));
        }
        let padding = b0 & 0x20 != 0;
        let extension = b0 & 0x10 != 0;
        let csrc_count = (b0 & 0x0F) as usize;

        let b1 = buf.get_u8();
        let marker = b1 & 0x80 != 0;
        let payload_type = b1 & 0x7F;
        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < csrc_count * 4 {
            return Err(RtpError::Truncated);
        }
        buf.advance(csrc_count * 4);

        if extension {
            if buf.remaining() < 4 {
                return Err(RtpError::Truncated);
            }
            let _profile = buf.get_u16();
            let words = buf.get_u16() as usize;
            if buf.remaining() < words * 4 {
                return Err(RtpError::Truncated);
            }
            buf.advance(words * 4);
        }

        let mut payload = buf;
        if padding {
            let pad = *payload.last().ok_or(RtpError::BadPadding(0))?;
            if pad == 0 || pad as usize > payload.len() {
                return Err(RtpError::BadPadding(pad));
            }
            payload = &payload[..payload.len() - pad as usize];
        }

        Ok(RtpPacket {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload,
        })
    }
}

/// Remove an RTSP interleaved prefix (`$ ch len`) if the buffer carries one.
///
/// An RTP packet never starts with `$` (that would be version 0).
pub fn strip_interleaved(data: &[u8]) -> &[u8] {
    if data.len() > INTERLEAVED_PREFIX_LEN && data[0] == INTERLEAVED_MAGIC {
        let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
        if declared <= data.len() - INTERLEAVED_PREFIX_LEN {
            return &data[INTERLEAVED_PREFIX_LEN..INTERLEAVED_PREFIX_LEN + declared];
        }
    }
    data
}

/// Read the SSRC of a (possibly interleaved) RTP packet without full parsing.
pub fn peek_ssrc(data: &[u8]) -> Option<u32> {
    let rtp = strip_interleaved(data);
    if rtp.len() < RTP_HEADER_LEN || rtp[0] >> 6 != RTP_VERSION {
        return None;
    }
    Some(u32::from_be_bytes([rtp[8], rtp[9], rtp[10], rtp[11]]))
}

/// SSRC as 8 upper-case hex characters, most significant byte first.
pub fn ssrc_to_stream_id(ssrc: u32) -> String {
    format!("{ssrc:08X}")
}

// ─── Sequence Monitor ────────────────────────────────────────────────────────

/// Tracks RTP sequence continuity. Gaps are reported, never acted upon.
#[derive(Debug, Default)]
pub struct SequenceMonitor {
    last: Option<u16>,
    gaps: u64,
}

impl SequenceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq`. Returns the expected sequence number when `seq` does
    /// not follow the previous one.
    pub fn observe(&mut self, seq: u16) -> Option<u16> {
        let gap = match self.last {
            Some(last) if seq != last.wrapping_add(1) => Some(last.wrapping_add(1)),
            _ => None,
        };
        if gap.is_some() {
            self.gaps += 1;
        }
        self.last = Some(seq);
        gap
    }

    pub fn last(&self) -> Option<u16> {
        self.last
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }
}

// ─── Payload Assembler ───────────────────────────────────────────────────────

/// A container chunk: the concatenated payloads of consecutive RTP packets
/// sharing one RTP timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadChunk {
    pub timestamp: u32,
    /// A sequence gap occurred while this chunk was being collected.
    pub packet_lost: bool,
    pub data: Bytes,
}

/// Groups MP2P / MP2T RTP payloads into chunks for the demultiplexer.
///
/// A chunk is emitted when the RTP timestamp changes or when a packet with
/// the marker bit completes it. Sequence gaps do not discard buffered data:
/// the demultiplexer resynchronizes on its own, so the chunk is only flagged.
/// A group that reaches the size limit is emitted early; the demultiplexer
/// is streaming, so the split costs nothing downstream.
#[derive(Debug)]
pub struct PayloadAssembler {
    buf: BytesMut,
    timestamp: Option<u32>,
    next_seq: Option<u16>,
    packet_lost: bool,
    max_chunk: usize,
    forced_flushes: u64,
}

impl Default for PayloadAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadAssembler {
    pub fn new() -> Self {
        Self::with_max_chunk(MAX_CHUNK_SIZE)
    }

    pub fn with_max_chunk(max_chunk: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            timestamp: None,
            next_seq: None,
            packet_lost: false,
            max_chunk: max_chunk.max(1),
            forced_flushes: 0,
        }
    }

    /// Feed one packet; `emit` is called for every chunk it completes
    /// (at most two: the previous timestamp group and this packet's own).
    pub fn push(&mut self, pkt: &RtpPacket<'_>, mut emit: impl FnMut(PayloadChunk)) {
        if matches!(self.next_seq, Some(expected) if expected != pkt.sequence) {
            self.packet_lost = true;
        }
        self.next_seq = Some(pkt.sequence.wrapping_add(1));

        if let Some(ts) = self.timestamp {
            if ts != pkt.timestamp && !self.buf.is_empty() {
                emit(self.take(ts));
            }
        }
        self.timestamp = Some(pkt.timestamp);

        if pkt.payload.is_empty() {
            return;
        }
        self.buf.extend_from_slice(pkt.payload);

        if pkt.marker {
            emit(self.take(pkt.timestamp));
        } else if self.buf.len() >= self.max_chunk {
            self.forced_flushes += 1;
            if self.forced_flushes == 1 {
                warn!(
                    pending = self.buf.len(),
                    timestamp = pkt.timestamp,
                    "chunk size limit reached without marker or timestamp change, flushing"
                );
            } else {
                debug!(pending = self.buf.len(), timestamp = pkt.timestamp, "chunk flushed at size limit");
            }
            emit(self.take(pkt.timestamp));
        }
    }

    /// Chunks emitted because they hit the size limit.
    pub fn forced_flushes(&self) -> u64 {
        self.forced_flushes
    }

    /// Bytes collected for the current, not yet emitted chunk.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, timestamp: u32) -> PayloadChunk {
        let chunk = PayloadChunk {
            timestamp,
            packet_lost: self.packet_lost,
            data: self.buf.split().freeze(),
        };
        self.packet_lost = false;
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RtpBuilder;

    #[test]
    fn parse_basic_header() {
        let raw = RtpBuilder::new(0x1234_5678)
            .sequence(7)
            .timestamp(90_000)
            .marker(true)
            .payload_type(96)
            .build(b"abc");
        let pkt = RtpPacket::parse(&raw).unwrap();
        assert!(pkt.marker);
        assert_eq!(pkt.payload_type, 96);
        assert_eq!(pkt.sequence, 7);
        assert_eq!(pkt.timestamp, 90_000);
        assert_eq!(pkt.ssrc, 0x1234_5678);
        assert_eq!(pkt.payload, b"abc");
    }

    #[test]
    fn parse_skips_csrc_extension_and_padding() {
        let mut raw = vec![
            0x80 | 0x20 | 0x10 | 0x02, // V=2, P, X, CC=2
            96,
            0x00,
            0x01,
            0,
            0,
            0,
            1,
            0xDE,
            0xAD,
            0xBE,
            0xEF,
        ];
        raw.extend_from_slice(&[1, 1, 1, 1, 2, 2, 2, 2]); // CSRCs
        raw.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 9, 9, 9, 9]); // 1-word extension
        raw.extend_from_slice(b"payload");
        raw.extend_from_slice(&[0, 0, 3]); // 3 bytes padding
        let pkt = RtpPacket::parse(&raw).unwrap();
        assert_eq!(pkt.ssrc, 0xDEAD_BEEF);
        assert_eq!(pkt.payload, b"payload");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(RtpPacket::parse(&[0x80; 4]), Err(RtpError::TooShort(4)));
        let mut raw = RtpBuilder::new(1).build(b"x");
        raw[0] = 0x40; // version 1
        assert_eq!(RtpPacket::parse(&raw), Err(RtpError::BadVersion(1)));
        let mut raw = RtpBuilder::new(1).build(b"x");
        raw[0] |= 0x0F; // 15 CSRCs that are not there
        assert_eq!(RtpPacket::parse(&raw), Err(RtpError::Truncated));
        let mut raw = RtpBuilder::new(1).build(&[1, 2, 0x20]);
        raw[0] |= 0x20; // padding longer than payload
        assert_eq!(RtpPacket::parse(&raw), Err(RtpError::BadPadding(0x20)));
    }

    #[test]
    fn interleaved_prefix_is_stripped() {
        let rtp = RtpBuilder::new(0xAABB_CCDD).build(b"data");
        let mut framed = vec![b'$', 0, 0, 0];
        framed[2..4].copy_from_slice(&(rtp.len() as u16).to_be_bytes());
        framed.extend_from_slice(&rtp);
        assert_eq!(strip_interleaved(&framed), &rtp[..]);
        assert_eq!(strip_interleaved(&rtp), &rtp[..]);
        assert_eq!(peek_ssrc(&framed), Some(0xAABB_CCDD));
        assert_eq!(peek_ssrc(b"short"), None);
    }

    #[test]
    fn stream_id_is_big_endian_hex() {
        assert_eq!(ssrc_to_stream_id(0x0000_00AB), "000000AB");
        assert_eq!(ssrc_to_stream_id(0xDEAD_BEEF), "DEADBEEF");
    }

    #[test]
    fn sequence_monitor_reports_gaps_and_wraps() {
        let mut mon = SequenceMonitor::new();
        assert_eq!(mon.observe(100), None); // first packet never reports
        assert_eq!(mon.observe(101), None);
        assert_eq!(mon.observe(105), Some(102));
        assert_eq!(mon.gaps(), 1);
        let mut mon = SequenceMonitor::new();
        mon.observe(u16::MAX);
        assert_eq!(mon.observe(0), None);
        assert_eq!(mon.last(), Some(0));
    }

    fn packet(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Vec<u8> {
        RtpBuilder::new(1)
            .sequence(seq)
            .timestamp(ts)
            .marker(marker)
            .build(payload)
    }

    #[test]
    fn assembler_groups_by_timestamp() {
        let mut asm = PayloadAssembler::new();
        let mut out = Vec::new();
        for raw in [
            packet(1, 3000, false, b"ab"),
            packet(2, 3000, false, b"cd"),
            packet(3, 6000, false, b"ef"),
        ] {
            asm.push(&RtpPacket::parse(&raw).unwrap(), |c| out.push(c));
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, 3000);
        assert_eq!(&out[0].data[..], b"abcd");
        assert!(!out[0].packet_lost);
        assert_eq!(asm.pending_len(), 2);
    }

    #[test]
    fn assembler_flushes_on_marker() {
        let mut asm = PayloadAssembler::new();
        let mut out = Vec::new();
        let raw = packet(1, 3000, true, b"whole");
        asm.push(&RtpPacket::parse(&raw).unwrap(), |c| out.push(c));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"whole");
        assert_eq!(asm.pending_len(), 0);
    }

    #[test]
    fn assembler_flags_gap_but_keeps_data() {
        let mut asm = PayloadAssembler::new();
        let mut out = Vec::new();
        for raw in [
            packet(1, 3000, false, b"ab"),
            packet(3, 3000, true, b"cd"),
            packet(4, 6000, true, b"ef"),
        ] {
            asm.push(&RtpPacket::parse(&raw).unwrap(), |c| out.push(c));
        }
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].data[..], b"abcd");
        assert!(out[0].packet_lost);
        assert!(!out[1].packet_lost);
    }

    #[test]
    fn assembler_flushes_at_size_limit() {
        let mut asm = PayloadAssembler::new();
        let mut out = Vec::new();
        let payload = vec![0xAB; 1400];
        let packets = 2 * MAX_CHUNK_SIZE / payload.len() + 10;
        for seq in 0..packets {
            let raw = packet(seq as u16, 0, false, &payload);
            asm.push(&RtpPacket::parse(&raw).unwrap(), |c| out.push(c));
        }
        assert_eq!(out.len(), 2);
        assert_eq!(asm.forced_flushes(), 2);
        assert!(out.iter().all(|c| c.data.len() >= MAX_CHUNK_SIZE && c.data.len() < MAX_CHUNK_SIZE + 1400));
        assert!(asm.pending_len() < MAX_CHUNK_SIZE);
        let total: usize = out.iter().map(|c| c.data.len()).sum::<usize>() + asm.pending_len();
        assert_eq!(total, packets * payload.len());
    }

    #[test]
    fn small_limit_splits_one_timestamp_group() {
        let mut asm = PayloadAssembler::with_max_chunk(4);
        let mut out = Vec::new();
        for raw in [
            packet(1, 3000, false, b"ab"),
            packet(2, 3000, false, b"cd"),
            packet(3, 3000, false, b"ef"),
            packet(4, 6000, false, b"gh"),
        ] {
            asm.push(&RtpPacket::parse(&raw).unwrap(), |c| out.push(c));
        }
        let data: Vec<&[u8]> = out.iter().map(|c| &c.data[..]).collect();
        assert_eq!(data, [&b"abcd"[..], &b"ef"[..]]);
        assert!(out.iter().all(|c| c.timestamp == 3000));
        assert_eq!(asm.pending_len(), 2);
    }
}
