//! Library error type.
//!
//! Per-packet problems never surface here: they are logged and reported
//! through [`crate::process::RtpInput`]. These errors cover setup paths
//! (configuration, dump files, sockets).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("unsupported config version {0}")]
    ConfigVersion(u32),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
