//! # Codec Track Registry
//!
//! At most one track per media kind. The first supported codec seen for a
//! kind establishes the track; it is never replaced afterwards, and frames
//! reporting another codec for that kind are rejected.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{Codec, CodecId, G711Law, MediaKind};

/// G.711 is always published as A-law: the demultiplexer's law detection
/// is not trusted.
pub const G711_FORCED_LAW: G711Law = G711Law::ALaw;
pub const G711_SAMPLE_RATE: u32 = 8_000;
pub const G711_CHANNELS: u8 = 1;
pub const G711_SAMPLE_BITS: u8 = 16;

/// What the publisher needs to register an elementary track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackDescriptor {
    H264,
    H265,
    /// Sample format comes from the ADTS headers.
    Aac,
    G711 {
        law: G711Law,
        sample_rate: u32,
        channels: u8,
        sample_bits: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Track {
    pub kind: MediaKind,
    pub codec: Codec,
    pub descriptor: TrackDescriptor,
}

impl Track {
    /// Track for a supported codec; `None` for anything else.
    pub fn for_codec(codec: Codec) -> Option<Self> {
        let (kind, descriptor) = match codec {
            Codec::H264 => (MediaKind::Video, TrackDescriptor::H264),
            Codec::H265 => (MediaKind::Video, TrackDescriptor::H265),
            Codec::Aac => (MediaKind::Audio, TrackDescriptor::Aac),
            Codec::G711 => (
                MediaKind::Audio,
                TrackDescriptor::G711 {
                    law: G711_FORCED_LAW,
                    sample_rate: G711_SAMPLE_RATE,
                    channels: G711_CHANNELS,
                    sample_bits: G711_SAMPLE_BITS,
                },
            ),
            Codec::Unsupported(_) => return None,
        };
        Some(Self {
            kind,
            codec,
            descriptor,
        })
    }
}

/// Outcome of [`TrackRegistry::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First frame of this kind; the caller registers the track downstream.
    Created(Track),
    Accepted,
    /// The kind is already established with another codec. Drop the frame.
    Rejected { established: Codec },
    /// Not a codec the pipeline forwards. Drop the frame.
    Unsupported,
    /// Neutral sentinel id. Drop the frame silently.
    Ignored,
}

impl Observation {
    /// Whether the frame should be forwarded.
    pub fn forwards(&self) -> bool {
        matches!(self, Observation::Created(_) | Observation::Accepted)
    }
}

#[derive(Debug, Default)]
pub struct TrackRegistry {
    video: Option<Track>,
    audio: Option<Track>,
    logged_unsupported: HashSet<CodecId>,
    logged_rejected: HashSet<CodecId>,
    rejected_frames: u64,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a frame with an id whose media kind is derived from the id.
    pub fn observe_id(&mut self, id: CodecId) -> Observation {
        if id.is_none() {
            return Observation::Ignored;
        }
        match id.media_kind() {
            Some(kind) => self.observe(kind, id),
            None => self.unsupported(id),
        }
    }

    pub fn observe(&mut self, kind: MediaKind, id: CodecId) -> Observation {
        if id.is_none() {
            return Observation::Ignored;
        }
        let codec = Codec::from_id(id);
        if !codec.is_supported() || codec.media_kind() != Some(kind) {
            return self.unsupported(id);
        }

        let slot = match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        };
        match slot {
            None => {
                let Some(track) = Track::for_codec(codec) else {
                    return Observation::Unsupported;
                };
                *slot = Some(track);
                info!(%kind, %codec, "track created");
                if let Some(law) = id.g711_law().filter(|law| *law != G711_FORCED_LAW) {
                    info!(reported = ?law, published = ?G711_FORCED_LAW, "G.711 law overridden");
                }
                Observation::Created(track)
            }
            Some(track) if track.codec == codec => Observation::Accepted,
            Some(track) => {
                let established = track.codec;
                self.rejected_frames += 1;
                if self.logged_rejected.insert(id) {
                    warn!(%kind, %established, reported = %codec, "codec changed mid-session, frames rejected");
                } else {
                    debug!(%kind, %established, reported = %codec, "frame rejected");
                }
                Observation::Rejected { established }
            }
        }
    }

    pub fn track(&self, kind: MediaKind) -> Option<&Track> {
        match kind {
            MediaKind::Video => self.video.as_ref(),
            MediaKind::Audio => self.audio.as_ref(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.video.iter().chain(self.audio.iter())
    }

    pub fn rejected_frames(&self) -> u64 {
        self.rejected_frames
    }

    fn unsupported(&mut self, id: CodecId) -> Observation {
        if self.logged_unsupported.insert(id) {
            info!(codec = %id, "unsupported codec, frames dropped");
        }
        Observation::Unsupported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_codec_wins() {
        let mut reg = TrackRegistry::new();
        let created = reg.observe(MediaKind::Video, CodecId::VIDEO_H264);
        assert!(matches!(created, Observation::Created(t) if t.codec == Codec::H264));
        assert_eq!(reg.observe(MediaKind::Video, CodecId::VIDEO_H264), Observation::Accepted);
        assert_eq!(
            reg.observe(MediaKind::Video, CodecId::VIDEO_H265),
            Observation::Rejected {
                established: Codec::H264
            }
        );
        assert_eq!(reg.track(MediaKind::Video).map(|t| t.codec), Some(Codec::H264));
        assert_eq!(reg.rejected_frames(), 1);
    }

    #[test]
    fn kinds_are_independent() {
        let mut reg = TrackRegistry::new();
        assert!(reg.observe_id(CodecId::VIDEO_H265).forwards());
        assert!(reg.observe_id(CodecId::AUDIO_AAC).forwards());
        assert_eq!(reg.tracks().count(), 2);
    }

    #[test]
    fn g711_is_forced_to_alaw() {
        let mut reg = TrackRegistry::new();
        let Observation::Created(track) = reg.observe_id(CodecId::AUDIO_G711U) else {
            panic!("expected track creation");
        };
        assert_eq!(
            track.descriptor,
            TrackDescriptor::G711 {
                law: G711Law::ALaw,
                sample_rate: 8_000,
                channels: 1,
                sample_bits: 16,
            }
        );
        // A-law and µ-law ids are the same codec to the registry.
        assert_eq!(reg.observe_id(CodecId::AUDIO_G711A), Observation::Accepted);
    }

    #[test]
    fn unsupported_and_sentinel_create_nothing() {
        let mut reg = TrackRegistry::new();
        assert_eq!(reg.observe_id(CodecId::VIDEO_SVAC), Observation::Unsupported);
        assert_eq!(reg.observe_id(CodecId::AUDIO_G729), Observation::Unsupported);
        assert_eq!(reg.observe_id(CodecId(0x42)), Observation::Unsupported);
        assert_eq!(reg.observe_id(CodecId::NONE), Observation::Ignored);
        // Kind mismatch: AAC reported on the video path.
        assert_eq!(reg.observe(MediaKind::Video, CodecId::AUDIO_AAC), Observation::Unsupported);
        assert_eq!(reg.tracks().count(), 0);
        // Still free to establish later.
        assert!(matches!(reg.observe_id(CodecId::VIDEO_H264), Observation::Created(_)));
    }
}
