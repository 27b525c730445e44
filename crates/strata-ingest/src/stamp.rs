//! # Timestamp Normalization
//!
//! Per-codec correction of demuxed timestamps before they reach the
//! publisher. Output starts at zero for each codec, keeps the pts−dts
//! offset, and its dts never goes backwards.

use std::collections::HashMap;

use tracing::debug;

use crate::codec::CodecId;

/// Default threshold above which a dts step is treated as a discontinuity.
pub const DEFAULT_MAX_JUMP_MS: i64 = 10_000;

/// Normalizer for one elementary stream. Timestamps are milliseconds.
#[derive(Debug, Clone)]
pub struct Stamp {
    max_jump_ms: i64,
    /// Added to input dts to get output dts.
    offset: i64,
    last_dts: Option<i64>,
    reanchors: u64,
}

impl Default for Stamp {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_JUMP_MS)
    }
}

impl Stamp {
    pub fn new(max_jump_ms: i64) -> Self {
        Self {
            max_jump_ms: max_jump_ms.max(0),
            offset: 0,
            last_dts: None,
            reanchors: 0,
        }
    }

    /// Correct one `(dts, pts)` pair. A zero pts means "same as dts".
    ///
    /// - first call anchors the stream at 0
    /// - a small backward dts step holds at the previous value
    /// - a step larger than the jump threshold, either way, re-anchors so
    ///   output continues from the previous value
    pub fn revise(&mut self, dts: i64, pts: i64) -> (i64, i64) {
        let pts = if pts == 0 { dts } else { pts };
        let diff = pts - dts;

        let Some(last) = self.last_dts else {
            self.offset = -dts;
            self.last_dts = Some(0);
            return (0, diff.max(0));
        };

        let mut out = dts + self.offset;
        let step = out - last;
        if step.abs() > self.max_jump_ms {
            self.offset = last - dts;
            self.reanchors += 1;
            out = last;
        } else if step < 0 {
            out = last;
        }
        self.last_dts = Some(out);
        (out, (out + diff).max(0))
    }

    /// Last corrected dts.
    pub fn last_dts(&self) -> Option<i64> {
        self.last_dts
    }

    /// Discontinuities absorbed so far.
    pub fn reanchors(&self) -> u64 {
        self.reanchors
    }
}

/// Independent [`Stamp`]s keyed by codec id.
#[derive(Debug, Clone, Default)]
pub struct StampSet {
    max_jump_ms: i64,
    stamps: HashMap<CodecId, Stamp>,
}

impl StampSet {
    pub fn new(max_jump_ms: i64) -> Self {
        Self {
            max_jump_ms,
            stamps: HashMap::new(),
        }
    }

    pub fn revise(&mut self, codec: CodecId, dts: i64, pts: i64) -> (i64, i64) {
        let max_jump_ms = self.max_jump_ms;
        let stamp = self
            .stamps
            .entry(codec)
            .or_insert_with(|| Stamp::new(max_jump_ms));
        let before = stamp.reanchors();
        let revised = stamp.revise(dts, pts);
        if stamp.reanchors() != before {
            debug!(%codec, dts, continued_at = revised.0, "timestamp discontinuity");
        }
        revised
    }

    pub fn get(&self, codec: CodecId) -> Option<&Stamp> {
        self.stamps.get(&codec)
    }
}
