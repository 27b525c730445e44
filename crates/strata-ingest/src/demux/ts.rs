//! # Transport Stream Engine
//!
//! Streaming MPEG-2 TS parser: PAT → PMT → pid map, PES reassembly per
//! elementary pid. A PES is emitted once its declared length is complete,
//! or when the next payload-unit-start arrives on the same pid.
//!
//! A PES without a declared length is bounded by [`MAX_PES_SIZE`]; one
//! that outgrows it is dropped whole.
//!
//! PSI sections are expected to fit in one packet, which holds for the
//! single-program streams IP cameras and GB28181 devices produce.

use std::collections::{HashMap, HashSet};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use super::pes::{self, PesParse, TimestampCarry};
use super::sniff::{TS_PACKET_SIZE, TS_SYNC_BYTE};
use super::{ContainerFormat, DecodeCallback, DecodedUnit, DemuxEngine};
use crate::codec::CodecId;

const PAT_PID: u16 = 0x0000;
const TABLE_PAT: u8 = 0x00;
const TABLE_PMT: u8 = 0x02;

/// Largest unbounded PES kept in memory.
pub const MAX_PES_SIZE: usize = 4 * 1024 * 1024;

/// In-progress PES on one pid.
#[derive(Default)]
struct PesAssembly {
    buf: BytesMut,
    /// Full PES size when the header declares one.
    expected: Option<usize>,
    last_cc: Option<u8>,
    carry: TimestampCarry,
}

pub struct TsDemuxer {
    /// Bytes of a packet split across `input` calls.
    pending: BytesMut,
    pmt_pids: HashSet<u16>,
    streams: HashMap<u16, CodecId>,
    assemblies: HashMap<u16, PesAssembly>,
    on_decode: DecodeCallback,
    max_pes: usize,
    oversized: u64,
}

impl TsDemuxer {
    pub fn new(on_decode: DecodeCallback) -> Self {
        Self {
            pending: BytesMut::new(),
            pmt_pids: HashSet::new(),
            streams: HashMap::new(),
            assemblies: HashMap::new(),
            on_decode,
            max_pes: MAX_PES_SIZE,
            oversized: 0,
        }
    }

    pub fn max_pes_size(mut self, max_pes: usize) -> Self {
        self.max_pes = max_pes;
        self
    }

    fn handle_packet(&mut self, pkt: Bytes) {
        if pkt[1] & 0x80 != 0 {
            debug!("TS transport error indicator set, packet dropped");
            return;
        }
        let pusi = pkt[1] & 0x40 != 0;
        let pid = (((pkt[1] & 0x1F) as u16) << 8) | pkt[2] as u16;
        let afc = (pkt[3] >> 4) & 0x03;
        let cc = pkt[3] & 0x0F;

        let mut offset = 4;
        if afc & 0x02 != 0 {
            offset += 1 + pkt[4] as usize;
        }
        if afc & 0x01 == 0 || offset >= TS_PACKET_SIZE {
            return;
        }
        let payload = pkt.slice(offset..);

        if pid == PAT_PID {
            if pusi {
                self.parse_pat(&payload);
            }
        } else if self.pmt_pids.contains(&pid) {
            if pusi {
                self.parse_pmt(&payload);
            }
        } else if let Some(&codec) = self.streams.get(&pid) {
            self.push_pes(pid, codec, cc, pusi, payload);
        }
    }

    fn parse_pat(&mut self, payload: &[u8]) {
        let Some((section, end)) = psi_section(payload, TABLE_PAT) else {
            return;
        };
        let mut pos = 8;
        while pos + 4 <= end {
            let program = u16::from_be_bytes([section[pos], section[pos + 1]]);
            let pid = u16::from_be_bytes([section[pos + 2], section[pos + 3]]) & 0x1FFF;
            // Program 0 points at the network PID.
            if program != 0 && self.pmt_pids.insert(pid) {
                debug!(program, pmt_pid = pid, "TS program found");
            }
            pos += 4;
        }
    }

    fn parse_pmt(&mut self, payload: &[u8]) {
        let Some((section, end)) = psi_section(payload, TABLE_PMT) else {
            return;
        };
        if end < 12 {
            return;
        }
        let info_len = (u16::from_be_bytes([section[10], section[11]]) & 0x0FFF) as usize;
        let mut pos = 12 + info_len;
        while pos + 5 <= end {
            let codec = CodecId(section[pos]);
            let pid = u16::from_be_bytes([section[pos + 1], section[pos + 2]]) & 0x1FFF;
            let es_info_len =
                (u16::from_be_bytes([section[pos + 3], section[pos + 4]]) & 0x0FFF) as usize;
            if self.streams.insert(pid, codec) != Some(codec) {
                debug!(pid, %codec, "TS stream mapped");
            }
            pos += 5 + es_info_len;
        }
    }

    fn push_pes(&mut self, pid: u16, codec: CodecId, cc: u8, pusi: bool, payload: Bytes) {
        let max_pes = self.max_pes;
        let asm = self.assemblies.entry(pid).or_default();
        if let Some(last) = asm.last_cc {
            if cc == last {
                // Duplicate packet.
                return;
            }
            if cc != (last + 1) & 0x0F {
                debug!(pid, expected = (last + 1) & 0x0F, got = cc, "TS continuity error, partial PES dropped");
                asm.buf.clear();
                asm.expected = None;
            }
        }
        asm.last_cc = Some(cc);

        if pusi {
            if !asm.buf.is_empty() {
                let pes = asm.buf.split().freeze();
                emit_pes(pid, codec, pes, &mut asm.carry, &mut self.on_decode);
            }
            asm.buf.extend_from_slice(&payload);
            asm.expected = match pes::parse_header(&asm.buf) {
                PesParse::Header(h) => h.total_len(),
                _ => None,
            };
        } else if asm.buf.is_empty() {
            // Waiting for a unit start.
            return;
        } else {
            asm.buf.extend_from_slice(&payload);
        }

        if asm.expected.is_none() && asm.buf.len() > max_pes {
            let dropped = asm.buf.len();
            asm.buf.clear();
            self.oversized += 1;
            warn!(pid, dropped, limit = max_pes, "PES exceeds size limit, dropped");
            return;
        }

        if let Some(expected) = asm.expected {
            if asm.buf.len() >= expected {
                let pes = asm.buf.split_to(expected).freeze();
                asm.buf.clear();
                asm.expected = None;
                emit_pes(pid, codec, pes, &mut asm.carry, &mut self.on_decode);
            }
        }
    }
}

impl DemuxEngine for TsDemuxer {
    fn input(&mut self, data: &[u8]) -> usize {
        self.pending.extend_from_slice(data);
        let mut skipped = 0usize;
        while self.pending.len() >= TS_PACKET_SIZE {
            if self.pending[0] != TS_SYNC_BYTE {
                let resync = self.pending[1..]
                    .iter()
                    .position(|&b| b == TS_SYNC_BYTE)
                    .map_or(self.pending.len(), |p| p + 1);
                self.pending.advance(resync);
                skipped += resync;
                continue;
            }
            let pkt = self.pending.split_to(TS_PACKET_SIZE).freeze();
            self.handle_packet(pkt);
        }
        if skipped > 0 {
            debug!(skipped, "TS resync");
        }
        data.len().saturating_sub(skipped)
    }

    fn format(&self) -> ContainerFormat {
        ContainerFormat::Ts
    }

    fn discarded_units(&self) -> u64 {
        self.oversized
    }
}

/// Locate a PSI section after the pointer field. Returns the section and
/// the offset where its CRC starts.
fn psi_section(payload: &[u8], table_id: u8) -> Option<(&[u8], usize)> {
    let pointer = *payload.first()? as usize;
    let section = payload.get(1 + pointer..)?;
    if section.len() < 3 || section[0] != table_id {
        return None;
    }
    let section_length = (u16::from_be_bytes([section[1], section[2]]) & 0x0FFF) as usize;
    let end = (3 + section_length).saturating_sub(4).min(section.len());
    Some((section, end))
}

fn emit_pes(
    pid: u16,
    codec: CodecId,
    pes: Bytes,
    carry: &mut TimestampCarry,
    on_decode: &mut DecodeCallback,
) {
    let header = match pes::parse_header(&pes) {
        PesParse::Header(h) => h,
        other => {
            debug!(pid, ?other, "malformed PES header");
            return;
        }
    };
    if header.header_len >= pes.len() {
        return;
    }
    let (pts, dts) = carry.resolve(&header);
    on_decode(DecodedUnit::new(pid, codec, pts, dts, pes.slice(header.header_len..)));
}
