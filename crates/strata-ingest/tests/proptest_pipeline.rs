//! Property-based tests for the ingest building blocks.
//!
//! Covers the invariants the session pipeline leans on: merged frames keep
//! every byte in order, tracks never change once established, container
//! sniffing is a pure function of the first chunk, normalized timestamps
//! never run backwards, and PS demuxing does not depend on chunk boundaries.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use proptest::prelude::*;

use strata_ingest::codec::{Codec, CodecId, MediaKind};
use strata_ingest::demux::ps::PsDemuxer;
use strata_ingest::demux::sniff::TS_PACKET_SIZE;
use strata_ingest::demux::{sniff, ContainerFormat, DecodedUnit, DemuxEngine};
use strata_ingest::merger::{Fragment, FrameMerger};
use strata_ingest::rtp::{PayloadAssembler, PayloadChunk, RtpPacket};
use strata_ingest::stamp::Stamp;
use strata_ingest::test_util::{adts_frame, h264_keyframe, h264_slice, PsMuxer, RtpBuilder};
use strata_ingest::track::{Observation, TrackRegistry};

// ─── Frame merger ────────────────────────────────────────────────────────────

proptest! {
    /// Emitted groups plus the still-pending group reproduce the input
    /// bytes in order, and no two adjacent groups share a dts.
    #[test]
    fn merger_preserves_bytes_and_splits_on_dts(
        frags in prop::collection::vec((0u32..6, any::<bool>(), prop::collection::vec(any::<u8>(), 0..32)), 1..40),
    ) {
        let mut merger = FrameMerger::new();
        let mut emitted: Vec<Fragment> = Vec::new();
        let mut input_bytes = Vec::new();
        for (dts, keyframe, data) in &frags {
            input_bytes.extend_from_slice(data);
            merger.input(
                Fragment { dts: *dts, pts: *dts, keyframe: *keyframe, data: Bytes::from(data.clone()) },
                |f| emitted.push(f),
            );
        }
        let pending = merger.buffered_bytes();
        let out_bytes: Vec<u8> = emitted.iter().flat_map(|f| f.data.iter().copied()).collect();
        prop_assert_eq!(out_bytes.len() + pending, input_bytes.len());
        prop_assert_eq!(&out_bytes[..], &input_bytes[..out_bytes.len()]);
        for pair in emitted.windows(2) {
            prop_assert_ne!(pair[0].dts, pair[1].dts);
        }
        prop_assert!(merger.pending_frames() >= 1);
    }
}

// ─── Track registry ──────────────────────────────────────────────────────────

fn any_codec_id() -> impl Strategy<Value = CodecId> {
    prop_oneof![
        Just(CodecId::NONE),
        Just(CodecId::VIDEO_H264),
        Just(CodecId::VIDEO_H265),
        Just(CodecId::AUDIO_AAC),
        Just(CodecId::AUDIO_G711A),
        Just(CodecId::AUDIO_G711U),
        Just(CodecId::AUDIO_MP3),
        Just(CodecId::VIDEO_SVAC),
        any::<u8>().prop_map(CodecId),
    ]
}

proptest! {
    /// The first supported codec of each kind owns the track for good.
    #[test]
    fn registry_tracks_are_stable(ids in prop::collection::vec(any_codec_id(), 1..64)) {
        let mut registry = TrackRegistry::new();
        let mut first: [Option<Codec>; 2] = [None, None];
        for id in ids {
            let codec = Codec::from_id(id);
            let observation = registry.observe_id(id);
            let Some(kind) = codec.media_kind().filter(|_| codec.is_supported()) else {
                prop_assert!(!observation.forwards());
                continue;
            };
            let slot = match kind {
                MediaKind::Video => &mut first[0],
                MediaKind::Audio => &mut first[1],
            };
            match *slot {
                None => {
                    prop_assert!(matches!(observation, Observation::Created(t) if t.codec == codec));
                    *slot = Some(codec);
                }
                Some(established) if established == codec => {
                    prop_assert_eq!(observation, Observation::Accepted);
                }
                Some(established) => {
                    prop_assert_eq!(observation, Observation::Rejected { established });
                }
            }
            prop_assert_eq!(registry.track(kind).map(|t| t.codec), *slot);
        }
    }
}

// ─── Container sniffing ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn sniff_is_total_and_deterministic(chunk in prop::collection::vec(any::<u8>(), 0..600)) {
        let format = sniff(&chunk);
        prop_assert_eq!(format, sniff(&chunk));
        let looks_ts = chunk.first() == Some(&0x47) && chunk.len() % TS_PACKET_SIZE == 0;
        prop_assert_eq!(format == ContainerFormat::Ts, looks_ts);
    }

    #[test]
    fn whole_ts_packets_sniff_as_ts(packets in 1usize..6, fill in any::<u8>()) {
        let mut chunk = vec![fill; packets * TS_PACKET_SIZE];
        chunk[0] = 0x47;
        prop_assert_eq!(sniff(&chunk), ContainerFormat::Ts);
        chunk.push(0x47);
        prop_assert_eq!(sniff(&chunk), ContainerFormat::Ps);
    }
}

// ─── Timestamp normalization ─────────────────────────────────────────────────

proptest! {
    /// Output starts at 0, never decreases, and never steps by more than
    /// the jump threshold, whatever the input does.
    #[test]
    fn stamps_are_monotonic_and_bounded(
        max_jump in 1i64..20_000,
        input in prop::collection::vec((-100_000i64..100_000, 0i64..2_000), 1..100),
    ) {
        let mut stamp = Stamp::new(max_jump);
        let mut last: Option<i64> = None;
        for (dts, delay) in input {
            let (out_dts, out_pts) = stamp.revise(dts, dts + delay);
            prop_assert!(out_pts >= 0);
            match last {
                None => prop_assert_eq!(out_dts, 0),
                Some(prev) => {
                    prop_assert!(out_dts >= prev);
                    prop_assert!(out_dts - prev <= max_jump);
                }
            }
            last = Some(out_dts);
        }
        prop_assert_eq!(stamp.last_dts(), last);
    }
}

// ─── Payload assembly ────────────────────────────────────────────────────────

proptest! {
    /// Chunks plus the pending buffer carry exactly the packet payloads.
    #[test]
    fn assembler_keeps_every_payload_byte(
        packets in prop::collection::vec((0u32..4, any::<bool>(), prop::collection::vec(any::<u8>(), 0..64)), 1..50),
    ) {
        let mut assembler = PayloadAssembler::new();
        let mut chunks: Vec<PayloadChunk> = Vec::new();
        let mut expected = Vec::new();
        for (seq, (ts, marker, payload)) in packets.iter().enumerate() {
            expected.extend_from_slice(payload);
            let raw = RtpBuilder::new(1)
                .sequence(seq as u16)
                .timestamp(*ts)
                .marker(*marker)
                .build(payload);
            let pkt = RtpPacket::parse(&raw).unwrap();
            assembler.push(&pkt, |c| chunks.push(c));
        }
        let got: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
        prop_assert!(chunks.iter().all(|c| !c.data.is_empty() && !c.packet_lost));
        prop_assert_eq!(got.len() + assembler.pending_len(), expected.len());
        prop_assert_eq!(&got[..], &expected[..got.len()]);
    }
}

// ─── PS demuxing ─────────────────────────────────────────────────────────────

fn ps_stream() -> Vec<u8> {
    let mut mux = PsMuxer::new().video(0x1B).audio(0x0F);
    let mut stream = mux.video_frame(0, 40, &h264_keyframe(0x11, 300));
    stream.extend(mux.audio_frame(0, &adts_frame(40)));
    stream.extend(mux.video_frame(40, 80, &h264_slice(0x22, 120)));
    stream.extend(mux.audio_frame(23, &adts_frame(40)));
    stream.extend(mux.video_frame(80, 120, &h264_slice(0x33, 60)));
    stream
}

fn demux_in_pieces(stream: &[u8], cuts: &[usize]) -> Vec<DecodedUnit> {
    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = out.clone();
    let mut demux = PsDemuxer::new(Box::new(move |u: DecodedUnit| sink.lock().unwrap().push(u)));
    let mut start = 0;
    for &cut in cuts {
        let cut = cut.clamp(start, stream.len());
        demux.input(&stream[start..cut]);
        start = cut;
    }
    demux.input(&stream[start..]);
    let units = out.lock().unwrap().clone();
    units
}

proptest! {
    #[test]
    fn ps_units_do_not_depend_on_chunking(mut cuts in prop::collection::vec(0usize..1200, 0..12)) {
        cuts.sort_unstable();
        let stream = ps_stream();
        let whole = demux_in_pieces(&stream, &[]);
        prop_assert_eq!(whole.len(), 5);
        let pieces = demux_in_pieces(&stream, &cuts);
        prop_assert_eq!(pieces, whole);
    }
}
