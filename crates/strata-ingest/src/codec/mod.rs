//! # Codec Identification
//!
//! Codec ids are the MPEG `stream_type` values carried by a program stream
//! map or a TS PMT. The demultiplexer reports them as-is; [`Codec`] is the
//! closed set the pipeline knows how to forward.

pub mod nal;

use std::fmt;

use serde::Serialize;

// ─── Codec Id ────────────────────────────────────────────────────────────────

/// Raw stream-type id reported by the demultiplexer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct CodecId(pub u8);

impl CodecId {
    /// Neutral sentinel: no stream type known for this elementary stream.
    pub const NONE: CodecId = CodecId(0x00);
    pub const AUDIO_MP3: CodecId = CodecId(0x03);
    pub const AUDIO_MPEG2: CodecId = CodecId(0x04);
    pub const AUDIO_AAC: CodecId = CodecId(0x0F);
    pub const VIDEO_MPEG4: CodecId = CodecId(0x10);
    pub const VIDEO_H264: CodecId = CodecId(0x1B);
    pub const VIDEO_H265: CodecId = CodecId(0x24);
    pub const VIDEO_SVAC: CodecId = CodecId(0x80);
    pub const AUDIO_G711A: CodecId = CodecId(0x90);
    pub const AUDIO_G711U: CodecId = CodecId(0x91);
    pub const AUDIO_G722: CodecId = CodecId(0x92);
    pub const AUDIO_G723: CodecId = CodecId(0x93);
    pub const AUDIO_G729: CodecId = CodecId(0x99);
    pub const AUDIO_SVAC: CodecId = CodecId(0x9B);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Media kind this stream type belongs to, if it is a known one.
    pub fn media_kind(self) -> Option<MediaKind> {
        match self {
            Self::VIDEO_H264 | Self::VIDEO_H265 | Self::VIDEO_MPEG4 | Self::VIDEO_SVAC => {
                Some(MediaKind::Video)
            }
            Self::AUDIO_MP3
            | Self::AUDIO_MPEG2
            | Self::AUDIO_AAC
            | Self::AUDIO_G711A
            | Self::AUDIO_G711U
            | Self::AUDIO_G722
            | Self::AUDIO_G723
            | Self::AUDIO_G729
            | Self::AUDIO_SVAC => Some(MediaKind::Audio),
            _ => None,
        }
    }

    /// Companding law a G.711 stream type announces.
    pub fn g711_law(self) -> Option<G711Law> {
        match self {
            Self::AUDIO_G711A => Some(G711Law::ALaw),
            Self::AUDIO_G711U => Some(G711Law::MuLaw),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NONE => "none",
            Self::AUDIO_MP3 => "MP3",
            Self::AUDIO_MPEG2 => "MPEG2-Audio",
            Self::AUDIO_AAC => "AAC",
            Self::VIDEO_MPEG4 => "MPEG4",
            Self::VIDEO_H264 => "H264",
            Self::VIDEO_H265 => "H265",
            Self::VIDEO_SVAC => "SVAC-Video",
            Self::AUDIO_G711A => "G711A",
            Self::AUDIO_G711U => "G711U",
            Self::AUDIO_G722 => "G722",
            Self::AUDIO_G723 => "G723",
            Self::AUDIO_G729 => "G729",
            Self::AUDIO_SVAC => "SVAC-Audio",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodecId({:#04x} {})", self.0, self.name())
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#04x})", self.name(), self.0)
    }
}

// ─── Media Kind ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => f.write_str("video"),
            MediaKind::Audio => f.write_str("audio"),
        }
    }
}

// ─── Codec ───────────────────────────────────────────────────────────────────

/// G.711 companding law.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum G711Law {
    ALaw,
    MuLaw,
}

/// Codecs the pipeline forwards to the publisher.
///
/// Anything else the demultiplexer reports maps to `Unsupported` and is
/// dropped after one log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Codec {
    H264,
    H265,
    Aac,
    G711,
    Unsupported(CodecId),
}

impl Codec {
    pub fn from_id(id: CodecId) -> Self {
        match id {
            CodecId::VIDEO_H264 => Codec::H264,
            CodecId::VIDEO_H265 => Codec::H265,
            CodecId::AUDIO_AAC => Codec::Aac,
            // The demuxer cannot tell the laws apart reliably; both ids
            // collapse to one codec and are forwarded as A-law.
            CodecId::AUDIO_G711A | CodecId::AUDIO_G711U => Codec::G711,
            other => Codec::Unsupported(other),
        }
    }

    pub fn media_kind(self) -> Option<MediaKind> {
        match self {
            Codec::H264 | Codec::H265 => Some(MediaKind::Video),
            Codec::Aac | Codec::G711 => Some(MediaKind::Audio),
            Codec::Unsupported(id) => id.media_kind(),
        }
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, Codec::Unsupported(_))
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::H264 => "H264",
            Codec::H265 => "H265",
            Codec::Aac => "AAC",
            Codec::G711 => "G711",
            Codec::Unsupported(id) => id.name(),
        }
    }

    /// NAL syntax of a video codec, for keyframe inspection.
    pub fn nal_syntax(self) -> Option<nal::NalSyntax> {
        match self {
            Codec::H264 => Some(nal::NalSyntax::H264),
            Codec::H265 => Some(nal::NalSyntax::H265),
            _ => None,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_ids_map_to_codecs() {
        assert_eq!(Codec::from_id(CodecId::VIDEO_H264), Codec::H264);
        assert_eq!(Codec::from_id(CodecId::VIDEO_H265), Codec::H265);
        assert_eq!(Codec::from_id(CodecId::AUDIO_AAC), Codec::Aac);
        assert_eq!(Codec::from_id(CodecId::AUDIO_G711A), Codec::G711);
        assert_eq!(Codec::from_id(CodecId::AUDIO_G711U), Codec::G711);
    }

    #[test]
    fn g711_ids_announce_their_law() {
        assert_eq!(CodecId::AUDIO_G711A.g711_law(), Some(G711Law::ALaw));
        assert_eq!(CodecId::AUDIO_G711U.g711_law(), Some(G711Law::MuLaw));
        assert_eq!(CodecId::AUDIO_AAC.g711_law(), None);
    }

    #[test]
    fn unsupported_ids_keep_their_kind() {
        let svac = Codec::from_id(CodecId::VIDEO_SVAC);
        assert_eq!(svac, Codec::Unsupported(CodecId::VIDEO_SVAC));
        assert_eq!(svac.media_kind(), Some(MediaKind::Video));
        assert_eq!(Codec::from_id(CodecId::AUDIO_G729).media_kind(), Some(MediaKind::Audio));
        assert_eq!(Codec::from_id(CodecId::NONE).media_kind(), None);
        assert_eq!(Codec::from_id(CodecId(0x42)).media_kind(), None);
    }

    #[test]
    fn display_includes_hex_id() {
        assert_eq!(CodecId::VIDEO_H264.to_string(), "H264(0x1b)");
        assert_eq!(CodecId(0x42).name(), "unknown");
    }
}
