//! Frames handed to the publisher.

use bytes::Bytes;
use serde::Serialize;

use crate::codec::Codec;

/// Annex B start code ahead of H.264 / H.265 access units.
pub const VIDEO_PREFIX_SIZE: usize = 4;
/// ADTS header ahead of AAC frames.
pub const AAC_PREFIX_SIZE: usize = 7;
pub const G711_PREFIX_SIZE: usize = 0;

/// One access unit (video) or decoded unit (audio), timestamps in ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub codec: Codec,
    pub dts: u32,
    pub pts: u32,
    /// Codec framing bytes at the front of `data`.
    pub prefix_size: usize,
    pub keyframe: bool,
    #[serde(skip)]
    pub data: Bytes,
}

impl Frame {
    pub fn video(codec: Codec, dts: u32, pts: u32, keyframe: bool, data: Bytes) -> Self {
        Self {
            codec,
            dts,
            pts,
            prefix_size: VIDEO_PREFIX_SIZE,
            keyframe,
            data,
        }
    }

    /// Audio frames carry no separate pts.
    pub fn audio(codec: Codec, dts: u32, data: Bytes) -> Self {
        let prefix_size = match codec {
            Codec::Aac => AAC_PREFIX_SIZE,
            _ => G711_PREFIX_SIZE,
        };
        Self {
            codec,
            dts,
            pts: dts,
            prefix_size,
            keyframe: false,
            data,
        }
    }

    /// Payload after the codec prefix.
    pub fn body(&self) -> &[u8] {
        self.data.get(self.prefix_size..).unwrap_or_default()
    }
}
