//! # strata-ingest
//!
//! RTP push ingest for MPEG-PS / MPEG-TS payloads.
//!
//! Untrusted RTP datagrams go in; timestamped, per-codec elementary frames
//! come out on a [`publish::MediaPublisher`]. One [`process::RtpProcess`]
//! exists per SSRC and owns the whole per-session pipeline.
//!
//! ## Crate structure
//!
//! - [`rtp`]: RTP header parsing, sequence monitor, MP2P payload assembly
//! - [`demux`]: PS/TS sniffing, demultiplexer adapter, built-in engines
//! - [`codec`]: Stream-type ids, codec sum type, NAL inspection
//! - [`stamp`]: Per-codec timestamp normalization
//! - [`track`]: Codec track registry (one track per media kind)
//! - [`merger`]: Same-dts frame coalescing
//! - [`frame`]: Frames handed to the publisher
//! - [`publish`]: Publisher, authorization and flow-report collaborators
//! - [`process`]: Session pipeline state machine
//! - [`sessions`]: SSRC → session table with liveness reaping
//! - [`config`]: TOML configuration
//! - [`dump`]: Best-effort debug dump files
//! - [`stats`] / [`metrics`]: Counters and Prometheus rendering
//! - [`test_util`]: RTP/PS/TS stream builders for tests

pub mod codec;
pub mod config;
pub mod demux;
pub mod dump;
pub mod error;
pub mod frame;
pub mod merger;
pub mod metrics;
pub mod process;
pub mod publish;
pub mod rtp;
pub mod sessions;
pub mod stamp;
pub mod stats;
pub mod test_util;
pub mod track;

pub use error::{IngestError, Result};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock_or_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
