//! # Demultiplexer Adapter
//!
//! Wraps an opaque PS/TS engine. The container format is sniffed from the
//! first chunk that reaches [`Demuxer::input`] and never revisited; the
//! engine is built at that point and takes ownership of the decode callback
//! registered at construction.
//!
//! Engines are streaming: they keep partial structures across calls. The
//! byte count they return excludes anything they had to throw away while
//! resynchronizing, which is what the adapter reports as a desync.

pub mod pes;
pub mod ps;
pub mod sniff;
pub mod ts;

use bytes::Bytes;
use tracing::{info, warn};

use crate::codec::{nal, Codec, CodecId};

pub use sniff::{sniff, ContainerFormat};

/// One decoded elementary-stream unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedUnit {
    /// PES stream id (PS) or pid (TS).
    pub stream: u16,
    pub codec: CodecId,
    pub flags: u32,
    /// 90 kHz.
    pub pts: i64,
    /// 90 kHz.
    pub dts: i64,
    pub data: Bytes,
}

impl DecodedUnit {
    pub const FLAG_KEYFRAME: u32 = 0x0001;

    /// Build a unit, flagging video random access points.
    pub fn new(stream: u16, codec: CodecId, pts: i64, dts: i64, data: Bytes) -> Self {
        let keyframe = Codec::from_id(codec)
            .nal_syntax()
            .is_some_and(|syntax| nal::contains_keyframe(&data, syntax));
        Self {
            stream,
            codec,
            flags: if keyframe { Self::FLAG_KEYFRAME } else { 0 },
            pts,
            dts,
            data,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags & Self::FLAG_KEYFRAME != 0
    }
}

/// Receives every unit an engine decodes.
pub type DecodeCallback = Box<dyn FnMut(DecodedUnit) + Send>;

/// Builds the engine for a sniffed format.
pub type EngineFactory =
    Box<dyn Fn(ContainerFormat, DecodeCallback) -> Box<dyn DemuxEngine> + Send>;

/// A PS or TS bitstream parser.
pub trait DemuxEngine: Send {
    /// Feed bytes; returns how many were consumed (buffered or parsed).
    fn input(&mut self, data: &[u8]) -> usize;

    fn format(&self) -> ContainerFormat;

    /// Units thrown away for exceeding the engine's size limits.
    fn discarded_units(&self) -> u64 {
        0
    }
}

/// Built-in engine for `format`.
pub fn default_engine(format: ContainerFormat, on_decode: DecodeCallback) -> Box<dyn DemuxEngine> {
    match format {
        ContainerFormat::Ps => Box::new(ps::PsDemuxer::new(on_decode)),
        ContainerFormat::Ts => Box::new(ts::TsDemuxer::new(on_decode)),
    }
}

/// Lazily-sniffing front of the engine.
pub struct Demuxer {
    factory: EngineFactory,
    on_decode: Option<DecodeCallback>,
    engine: Option<Box<dyn DemuxEngine>>,
    desyncs: u64,
}

impl Demuxer {
    pub fn new(on_decode: DecodeCallback) -> Self {
        Self::with_factory(Box::new(default_engine), on_decode)
    }

    pub fn with_factory(factory: EngineFactory, on_decode: DecodeCallback) -> Self {
        Self {
            factory,
            on_decode: Some(on_decode),
            engine: None,
            desyncs: 0,
        }
    }

    /// Feed one container chunk. Returns the bytes the engine consumed.
    ///
    /// `packet_lost` is only used to annotate the desync warning.
    pub fn input(&mut self, data: &[u8], packet_lost: bool) -> usize {
        if self.engine.is_none() {
            let format = sniff(data);
            info!(%format, first_chunk = data.len(), "container format judged");
            let on_decode = self.on_decode.take().unwrap_or_else(|| Box::new(|_: DecodedUnit| {}));
            self.engine = Some((self.factory)(format, on_decode));
        }
        let Some(engine) = self.engine.as_mut() else {
            return 0;
        };
        let consumed = engine.input(data);
        if consumed != data.len() {
            self.desyncs += 1;
            warn!(
                consumed,
                submitted = data.len(),
                packet_lost,
                format = %engine.format(),
                "demuxer did not consume the whole chunk"
            );
        }
        consumed
    }

    /// `None` until the first chunk has been seen.
    pub fn format(&self) -> Option<ContainerFormat> {
        self.engine.as_ref().map(|e| e.format())
    }

    pub fn discarded_units(&self) -> u64 {
        self.engine.as_ref().map_or(0, |e| e.discarded_units())
    }

    /// Chunks the engine did not fully consume.
    pub fn desyncs(&self) -> u64 {
        self.desyncs
    }
}

impl std::fmt::Debug for Demuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demuxer")
            .field("format", &self.format())
            .field("desyncs", &self.desyncs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{h264_keyframe, h264_slice};
    use std::sync::{Arc, Mutex};

    struct CountingEngine {
        format: ContainerFormat,
        consume: usize,
        on_decode: DecodeCallback,
    }

    impl DemuxEngine for CountingEngine {
        fn input(&mut self, data: &[u8]) -> usize {
            (self.on_decode)(DecodedUnit::new(
                0xE0,
                CodecId::NONE,
                0,
                0,
                Bytes::copy_from_slice(data),
            ));
            data.len().min(self.consume)
        }

        fn format(&self) -> ContainerFormat {
            self.format
        }
    }

    fn counting_factory(consume: usize, seen: Arc<Mutex<Vec<ContainerFormat>>>) -> EngineFactory {
        Box::new(move |format: ContainerFormat, on_decode: DecodeCallback| {
            seen.lock().unwrap().push(format);
            Box::new(CountingEngine {
                format,
                consume,
                on_decode,
            }) as Box<dyn DemuxEngine>
        })
    }

    #[test]
    fn format_is_decided_once_from_first_chunk() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let units = Arc::new(Mutex::new(0usize));
        let u = units.clone();
        let mut demux = Demuxer::with_factory(
            counting_factory(usize::MAX, seen.clone()),
            Box::new(move |_: DecodedUnit| *u.lock().unwrap() += 1),
        );
        assert_eq!(demux.format(), None);

        let mut ts = vec![0u8; 376];
        ts[0] = 0x47;
        assert_eq!(demux.input(&ts, false), 376);
        // A PS-looking chunk later does not change the decision.
        assert_eq!(demux.input(&[0, 0, 1, 0xBA], false), 4);

        assert_eq!(*seen.lock().unwrap(), vec![ContainerFormat::Ts]);
        assert_eq!(demux.format(), Some(ContainerFormat::Ts));
        assert_eq!(*units.lock().unwrap(), 2);
    }

    #[test]
    fn short_consumption_counts_as_desync() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut demux = Demuxer::with_factory(counting_factory(3, seen), Box::new(|_: DecodedUnit| {}));
        assert_eq!(demux.input(b"abcdef", true), 3);
        assert_eq!(demux.input(b"ab", false), 2);
        assert_eq!(demux.desyncs(), 1);
        assert_eq!(demux.format(), Some(ContainerFormat::Ps));
    }

    #[test]
    fn unit_keyframe_flag_from_nal_scan() {
        let key = DecodedUnit::new(0xE0, CodecId::VIDEO_H264, 0, 0, h264_keyframe(1, 8).into());
        assert!(key.is_keyframe());
        let delta = DecodedUnit::new(0xE0, CodecId::VIDEO_H264, 0, 0, h264_slice(1, 8).into());
        assert!(!delta.is_keyframe());
        let audio = DecodedUnit::new(0xC0, CodecId::AUDIO_AAC, 0, 0, h264_keyframe(1, 8).into());
        assert!(!audio.is_keyframe());
    }
}
