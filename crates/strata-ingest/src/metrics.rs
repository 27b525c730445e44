//! Prometheus text rendering for ingest sessions.

use std::fmt::Write;

use crate::stats::SessionSnapshot;

/// Render session snapshots in Prometheus text exposition format.
pub fn render_prometheus(sessions: &[SessionSnapshot]) -> String {
    let mut out = String::with_capacity(1024 + sessions.len() * 512);

    let _ = writeln!(out, "# HELP strata_ingest_sessions Number of RTP sessions.");
    let _ = writeln!(out, "# TYPE strata_ingest_sessions gauge");
    let _ = writeln!(out, "strata_ingest_sessions {}", sessions.len());

    let counters: [(&str, &str, fn(&SessionSnapshot) -> u64); 11] = [
        ("packets_accepted_total", "RTP packets accepted.", |s| s.stats.packets_accepted),
        ("bytes_accepted_total", "RTP bytes accepted.", |s| s.stats.bytes_accepted),
        ("dropped_address_total", "Packets dropped for a source address mismatch.", |s| {
            s.stats.dropped_address
        }),
        ("dropped_unauthorized_total", "Packets dropped before or after a publish decision.", |s| {
            s.stats.dropped_unauthorized
        }),
        ("dropped_invalid_total", "Packets with an invalid RTP header.", |s| s.stats.dropped_invalid),
        ("sequence_gaps_total", "RTP sequence discontinuities.", |s| s.stats.sequence_gaps),
        ("chunks_forced_total", "Chunks flushed at the size limit.", |s| s.stats.chunks_forced),
        ("demux_desyncs_total", "Chunks the demuxer did not fully consume.", |s| {
            s.stats.demux_desyncs
        }),
        ("units_discarded_total", "Oversized units dropped by the demuxer.", |s| {
            s.stats.units_discarded
        }),
        ("units_rejected_total", "Units rejected after a codec change.", |s| s.stats.units_rejected),
        ("frames_out_total", "Frames handed to the publisher.", |s| s.stats.frames_out),
    ];
    for (name, help, value) in counters {
        let _ = writeln!(out, "# HELP strata_ingest_{name} {help}");
        let _ = writeln!(out, "# TYPE strata_ingest_{name} counter");
        for s in sessions {
            let _ = writeln!(
                out,
                "strata_ingest_{name}{{stream=\"{}\"}} {}",
                s.identity.stream_id,
                value(s)
            );
        }
    }

    let _ = writeln!(out, "# HELP strata_ingest_idle_ms Time since the last accepted packet.");
    let _ = writeln!(out, "# TYPE strata_ingest_idle_ms gauge");
    for s in sessions {
        let _ = writeln!(
            out,
            "strata_ingest_idle_ms{{stream=\"{}\"}} {}",
            s.identity.stream_id, s.idle_ms
        );
    }

    let _ = writeln!(out, "# HELP strata_ingest_buffered_bytes Bytes held for the next chunk or frame.");
    let _ = writeln!(out, "# TYPE strata_ingest_buffered_bytes gauge");
    for s in sessions {
        let _ = writeln!(
            out,
            "strata_ingest_buffered_bytes{{stream=\"{}\"}} {}",
            s.identity.stream_id, s.buffered_bytes
        );
    }

    let _ = writeln!(out, "# HELP strata_ingest_readers Readers attached to the publisher.");
    let _ = writeln!(out, "# TYPE strata_ingest_readers gauge");
    for s in sessions {
        let _ = writeln!(
            out,
            "strata_ingest_readers{{stream=\"{}\"}} {}",
            s.identity.stream_id, s.readers
        );
    }

    let _ = writeln!(out, "# HELP strata_ingest_state Session state (1 for the current one).");
    let _ = writeln!(out, "# TYPE strata_ingest_state gauge");
    for s in sessions {
        let _ = writeln!(
            out,
            "strata_ingest_state{{stream=\"{}\",state=\"{}\"}} 1",
            s.identity.stream_id, s.state
        );
    }

    out
}
