//! Container format sniffing.

use std::fmt;

use serde::Serialize;

/// MPEG-TS packet size.
pub const TS_PACKET_SIZE: usize = 188;

/// MPEG-TS sync byte.
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Container carried in the RTP payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContainerFormat {
    /// MPEG-2 Program Stream.
    Ps,
    /// MPEG-2 Transport Stream.
    Ts,
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerFormat::Ps => f.write_str("PS"),
            ContainerFormat::Ts => f.write_str("TS"),
        }
    }
}

/// Classify the first chunk of a session.
///
/// TS when the chunk is a whole number of 188-byte packets and starts with
/// the sync byte; PS otherwise. Total: every input yields a format.
pub fn sniff(chunk: &[u8]) -> ContainerFormat {
    match chunk.first() {
        Some(&TS_SYNC_BYTE) if chunk.len() % TS_PACKET_SIZE == 0 => ContainerFormat::Ts,
        _ => ContainerFormat::Ps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_ts_packets_are_ts() {
        let mut chunk = vec![0u8; 376];
        chunk[0] = TS_SYNC_BYTE;
        assert_eq!(sniff(&chunk), ContainerFormat::Ts);
    }

    #[test]
    fn misaligned_or_unsynced_is_ps() {
        let mut chunk = vec![0u8; 200];
        chunk[0] = TS_SYNC_BYTE;
        assert_eq!(sniff(&chunk), ContainerFormat::Ps);
        let chunk = vec![0u8; 188];
        assert_eq!(sniff(&chunk), ContainerFormat::Ps);
        assert_eq!(sniff(&[0x00, 0x00, 0x01, 0xBA]), ContainerFormat::Ps);
        assert_eq!(sniff(&[]), ContainerFormat::Ps);
    }
}
