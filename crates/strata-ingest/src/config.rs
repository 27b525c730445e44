//! # Ingest Configuration
//!
//! TOML input structs deserialize with every field optional; `resolve()`
//! fills defaults and validates.
//!
//! ```toml
//! version = 1
//!
//! [rtp_proxy]
//! check_source = true
//! timeout_sec = 15
//! dump_dir = "/tmp/rtp-dump"
//!
//! [general]
//! flow_threshold_kb = 1024
//! publish_to_rtxp = true
//! publish_to_hls = true
//! publish_to_mp4 = false
//!
//! [stamp]
//! max_jump_ms = 10000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::publish::PublishOptions;
use crate::stamp::DEFAULT_MAX_JUMP_MS;

pub const CONFIG_VERSION: u32 = 1;

// ─── Input ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngestConfigInput {
    pub version: u32,
    pub rtp_proxy: RtpProxyConfigInput,
    pub general: GeneralConfigInput,
    pub stamp: StampConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RtpProxyConfigInput {
    pub check_source: Option<bool>,
    pub timeout_sec: Option<u64>,
    pub dump_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GeneralConfigInput {
    pub flow_threshold_kb: Option<u64>,
    pub publish_to_rtxp: Option<bool>,
    pub publish_to_hls: Option<bool>,
    pub publish_to_mp4: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StampConfigInput {
    pub max_jump_ms: Option<i64>,
}

// ─── Resolved ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RtpProxyConfig {
    /// Drop packets whose source differs from the first one seen.
    pub check_source: bool,
    /// A session with no accepted packet for this long is dead.
    pub timeout: Duration,
    /// Debug dump directory; `None` disables dumping.
    pub dump_dir: Option<PathBuf>,
}

impl Default for RtpProxyConfig {
    fn default() -> Self {
        Self {
            check_source: true,
            timeout: Duration::from_secs(15),
            dump_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneralConfig {
    /// Flow reports are only emitted above this many KiB.
    pub flow_threshold_kb: u64,
    /// Policy applied when no publish authority is listening.
    pub default_publish: PublishOptions,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            flow_threshold_kb: 1024,
            default_publish: PublishOptions {
                enable_rtxp: true,
                enable_hls: true,
                enable_mp4: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StampConfig {
    pub max_jump_ms: i64,
}

impl Default for StampConfig {
    fn default() -> Self {
        Self {
            max_jump_ms: DEFAULT_MAX_JUMP_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestConfig {
    pub rtp_proxy: RtpProxyConfig,
    pub general: GeneralConfig,
    pub stamp: StampConfig,
}

impl IngestConfig {
    /// Bytes above which a flow report is emitted at teardown.
    pub fn flow_threshold_bytes(&self) -> u64 {
        self.general.flow_threshold_kb.saturating_mul(1024)
    }
}

impl IngestConfigInput {
    pub fn resolve(self) -> Result<IngestConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(IngestError::ConfigVersion(version));
        }

        let defaults = IngestConfig::default();

        let timeout_sec = self
            .rtp_proxy
            .timeout_sec
            .unwrap_or(defaults.rtp_proxy.timeout.as_secs());
        if timeout_sec == 0 {
            return Err(IngestError::Config("rtp_proxy.timeout_sec must be > 0".into()));
        }
        let dump_dir = self.rtp_proxy.dump_dir.and_then(|dir| {
            let trimmed = dir.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(PathBuf::from(trimmed))
            }
        });
        let rtp_proxy = RtpProxyConfig {
            check_source: self
                .rtp_proxy
                .check_source
                .unwrap_or(defaults.rtp_proxy.check_source),
            timeout: Duration::from_secs(timeout_sec),
            dump_dir,
        };

        let publish = defaults.general.default_publish;
        let general = GeneralConfig {
            flow_threshold_kb: self
                .general
                .flow_threshold_kb
                .unwrap_or(defaults.general.flow_threshold_kb),
            default_publish: PublishOptions {
                enable_rtxp: self.general.publish_to_rtxp.unwrap_or(publish.enable_rtxp),
                enable_hls: self.general.publish_to_hls.unwrap_or(publish.enable_hls),
                enable_mp4: self.general.publish_to_mp4.unwrap_or(publish.enable_mp4),
            },
        };

        let max_jump_ms = self
            .stamp
            .max_jump_ms
            .unwrap_or(defaults.stamp.max_jump_ms);
        if max_jump_ms <= 0 {
            return Err(IngestError::Config("stamp.max_jump_ms must be > 0".into()));
        }

        Ok(IngestConfig {
            rtp_proxy,
            general,
            stamp: StampConfig { max_jump_ms },
        })
    }
}

impl IngestConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(IngestConfig::default());
        }
        let parsed: IngestConfigInput = toml::from_str(input)
            .map_err(|e| IngestError::Config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_gives_defaults() {
        let cfg = IngestConfig::from_toml_str("  ").unwrap();
        assert_eq!(cfg, IngestConfig::default());
        assert!(cfg.rtp_proxy.check_source);
        assert_eq!(cfg.rtp_proxy.timeout, Duration::from_secs(15));
        assert_eq!(cfg.flow_threshold_bytes(), 1024 * 1024);
        assert!(!cfg.general.default_publish.enable_mp4);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            version = 1

            [rtp_proxy]
            check_source = false
            timeout_sec = 30
            dump_dir = " /tmp/dump "

            [general]
            flow_threshold_kb = 16
            publish_to_rtxp = false
            publish_to_mp4 = true

            [stamp]
            max_jump_ms = 5000
        "#;
        let cfg = IngestConfig::from_toml_str(toml).unwrap();
        assert!(!cfg.rtp_proxy.check_source);
        assert_eq!(cfg.rtp_proxy.timeout, Duration::from_secs(30));
        assert_eq!(cfg.rtp_proxy.dump_dir.as_deref(), Some(Path::new("/tmp/dump")));
        assert_eq!(cfg.general.flow_threshold_kb, 16);
        assert_eq!(
            cfg.general.default_publish,
            PublishOptions {
                enable_rtxp: false,
                enable_hls: true,
                enable_mp4: true,
            }
        );
        assert_eq!(cfg.stamp.max_jump_ms, 5000);
    }

    #[test]
    fn blank_dump_dir_disables_dumping() {
        let cfg = IngestConfig::from_toml_str("[rtp_proxy]\ndump_dir = \"\"").unwrap();
        assert!(cfg.rtp_proxy.dump_dir.is_none());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            IngestConfig::from_toml_str("version = 2"),
            Err(IngestError::ConfigVersion(2))
        ));
        assert!(matches!(
            IngestConfig::from_toml_str("[rtp_proxy]\ntimeout_sec = 0"),
            Err(IngestError::Config(_))
        ));
        assert!(matches!(
            IngestConfig::from_toml_str("[stamp]\nmax_jump_ms = -1"),
            Err(IngestError::Config(_))
        ));
        assert!(matches!(
            IngestConfig::from_toml_str("not toml ="),
            Err(IngestError::Config(_))
        ));
    }
}
