//! Per-session counters and the serializable session snapshot.

use std::net::SocketAddr;

use serde::Serialize;

use crate::demux::ContainerFormat;
use crate::process::SessionState;
use crate::publish::MediaIdentity;
use crate::track::Track;

/// Counters kept by one [`crate::process::RtpProcess`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStats {
    /// Every `input_rtp` call.
    pub packets_received: u64,
    pub packets_accepted: u64,
    pub bytes_accepted: u64,
    /// Arrived while authorization was pending or after it was denied.
    pub dropped_unauthorized: u64,
    pub dropped_address: u64,
    pub dropped_invalid: u64,
    pub dropped_ssrc: u64,
    pub sequence_gaps: u64,
    pub chunks: u64,
    /// Chunks emitted at the size limit rather than on a timestamp change
    /// or marker.
    pub chunks_forced: u64,
    pub demux_desyncs: u64,
    /// Units the demuxer dropped for exceeding its size limit.
    pub units_discarded: u64,
    pub units_decoded: u64,
    /// Unsupported codec or no stream type.
    pub units_dropped: u64,
    /// Codec changed after the track was established.
    pub units_rejected: u64,
    pub frames_out: u64,
}

/// Point-in-time view of a session, as served on `/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub identity: MediaIdentity,
    pub state: SessionState,
    pub peer: Option<SocketAddr>,
    pub format: Option<ContainerFormat>,
    pub tracks: Vec<Track>,
    pub readers: usize,
    /// Payload and merged video held back for the next chunk or frame.
    pub buffered_bytes: usize,
    pub idle_ms: u64,
    pub alive: bool,
    pub stats: ProcessStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_json_shape() {
        let snap = SessionSnapshot {
            identity: MediaIdentity::for_ssrc(0xABCD),
            state: SessionState::Active,
            peer: Some("10.0.0.1:4000".parse().unwrap()),
            format: Some(ContainerFormat::Ps),
            tracks: Vec::new(),
            readers: 0,
            buffered_bytes: 0,
            idle_ms: 12,
            alive: true,
            stats: ProcessStats {
                packets_accepted: 5,
                ..Default::default()
            },
        };
        let json: serde_json::Value = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["identity"]["stream_id"], "0000ABCD");
        assert_eq!(json["state"], "active");
        assert_eq!(json["format"], "Ps");
        assert_eq!(json["peer"], "10.0.0.1:4000");
        assert_eq!(json["stats"]["packets_accepted"], 5);
    }
}
