//! # RTP Session Pipeline
//!
//! One [`RtpProcess`] per SSRC. It latches the sender address, asks the
//! [`PublishAuthority`] whether the stream may publish, and once allowed
//! runs every packet through:
//!
//! ```text
//! RTP parse → SSRC / sequence check → payload assembly → demux
//!     → 90 kHz → ms → timestamp normalization → track registry
//!     → frame merger (video) → MediaPublisher
//! ```
//!
//! State machine:
//!
//! ```text
//! Unbound ──first packet──▶ AuthPending ──allow──▶ Active
//!                               │
//!                               └──deny──▶ Rejected
//! (any) ──close / drop──▶ Closed
//! ```
//!
//! The host owns the session table and calls [`RtpProcess::alive`] to
//! decide when to tear a session down.
//!
//! Collaborators (publisher factory, publisher, listeners) are never called
//! with the session lock held. The data path queues tracks and frames; the
//! publisher is moved out of the session to receive them and moved back
//! afterwards. Whoever holds it drains the queue, so a publisher or
//! listener may call back into its session at any point.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::Receiver;
use quanta::{Clock, Instant};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Span};

use crate::codec::{Codec, MediaKind};
use crate::config::IngestConfig;
use crate::demux::{ContainerFormat, DecodedUnit, Demuxer, EngineFactory};
use crate::dump::SessionDump;
use crate::frame::Frame;
use crate::lock_or_recover;
use crate::merger::{Fragment, FrameMerger};
use crate::publish::{
    FlowReport, FlowReporter, LogFlowReporter, MediaIdentity, MediaListener, MediaPublisher,
    NoAuthority, PublishAuthority, PublishInvoker, PublishOptions, PublisherFactory,
};
use crate::rtp::{strip_interleaved, PayloadAssembler, PayloadChunk, RtpPacket, SequenceMonitor};
use crate::stamp::StampSet;
use crate::stats::{ProcessStats, SessionSnapshot};
use crate::track::{Observation, Track, TrackRegistry};

/// 90 kHz ticks per millisecond.
const TICKS_PER_MS: i64 = 90;

// ─── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No packet seen yet.
    Unbound,
    /// Address latched, publish decision outstanding.
    AuthPending,
    Active,
    /// Publishing denied; input is dropped.
    Rejected,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Unbound => "unbound",
            SessionState::AuthPending => "auth_pending",
            SessionState::Active => "active",
            SessionState::Rejected => "rejected",
            SessionState::Closed => "closed",
        })
    }
}

/// Result of [`RtpProcess::input_rtp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtpInput {
    pub accepted: bool,
    /// Last decode timestamp (ms) forwarded by this session.
    pub dts: Option<u32>,
}

impl RtpInput {
    const DROPPED: RtpInput = RtpInput {
        accepted: false,
        dts: None,
    };
}

/// Publisher work queued by the data path.
enum PublisherOutput {
    Track(Track),
    Frame(Frame),
}

/// External collaborators of a session.
#[derive(Clone)]
pub struct Collaborators {
    pub publishers: Arc<dyn PublisherFactory>,
    pub authority: Arc<dyn PublishAuthority>,
    pub flow: Arc<dyn FlowReporter>,
    pub clock: Clock,
}

impl Collaborators {
    /// No authority (default policy), flow reports to the log, real clock.
    pub fn new(publishers: Arc<dyn PublisherFactory>) -> Self {
        Self {
            publishers,
            authority: Arc::new(NoAuthority),
            flow: Arc::new(LogFlowReporter),
            clock: Clock::new(),
        }
    }

    pub fn with_authority(mut self, authority: Arc<dyn PublishAuthority>) -> Self {
        self.authority = authority;
        self
    }

    pub fn with_flow_reporter(mut self, flow: Arc<dyn FlowReporter>) -> Self {
        self.flow = flow;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

pub struct RtpProcess {
    identity: MediaIdentity,
    config: Arc<IngestConfig>,
    collab: Collaborators,
    created_at: Instant,
    span: Span,
    weak_self: Weak<RtpProcess>,
    inner: Mutex<ProcessInner>,
}

/// Everything the data path mutates.
struct ProcessInner {
    state: SessionState,
    peer: Option<SocketAddr>,
    last_active: Instant,
    last_accepted: Option<Instant>,
    total_bytes: u64,
    sequence: SequenceMonitor,
    assembler: PayloadAssembler,
    demuxer: Demuxer,
    decoded: Receiver<DecodedUnit>,
    stamps: StampSet,
    tracks: TrackRegistry,
    merger: FrameMerger,
    /// `None` while a caller has it out, or before activation.
    publisher: Option<Box<dyn MediaPublisher>>,
    outputs: Vec<PublisherOutput>,
    pending_listener: Option<Weak<dyn MediaListener>>,
    /// Reader count as of the last time the publisher was asked.
    readers: usize,
    dump: Option<SessionDump>,
    last_dts: Option<u32>,
    stats: ProcessStats,
}

impl RtpProcess {
    pub fn new(ssrc: u32, config: Arc<IngestConfig>, collab: Collaborators) -> Arc<Self> {
        Self::build(ssrc, config, collab, None)
    }

    /// Like [`RtpProcess::new`] with a custom demux engine factory.
    pub fn with_engine_factory(
        ssrc: u32,
        config: Arc<IngestConfig>,
        collab: Collaborators,
        factory: EngineFactory,
    ) -> Arc<Self> {
        Self::build(ssrc, config, collab, Some(factory))
    }

    fn build(
        ssrc: u32,
        config: Arc<IngestConfig>,
        collab: Collaborators,
        factory: Option<EngineFactory>,
    ) -> Arc<Self> {
        let identity = MediaIdentity::for_ssrc(ssrc);
        let span = info_span!("rtp", stream = %identity.stream_id);
        let now = collab.clock.now();

        let (tx, decoded) = crossbeam_channel::unbounded();
        let on_decode = Box::new(move |unit: DecodedUnit| {
            let _ = tx.send(unit);
        });
        let demuxer = match factory {
            Some(factory) => Demuxer::with_factory(factory, on_decode),
            None => Demuxer::new(on_decode),
        };
        let dump = config
            .rtp_proxy
            .dump_dir
            .as_deref()
            .map(|dir| SessionDump::open(dir, &identity.stream_id));

        let inner = ProcessInner {
            state: SessionState::Unbound,
            peer: None,
            last_active: now,
            last_accepted: None,
            total_bytes: 0,
            sequence: SequenceMonitor::new(),
            assembler: PayloadAssembler::new(),
            demuxer,
            decoded,
            stamps: StampSet::new(config.stamp.max_jump_ms),
            tracks: TrackRegistry::new(),
            merger: FrameMerger::new(),
            publisher: None,
            outputs: Vec::new(),
            pending_listener: None,
            readers: 0,
            dump,
            last_dts: None,
            stats: ProcessStats::default(),
        };

        span.in_scope(|| debug!("session created"));

        Arc::new_cyclic(|weak_self| Self {
            identity,
            config,
            collab,
            created_at: now,
            span,
            weak_self: weak_self.clone(),
            inner: Mutex::new(inner),
        })
    }

    /// Feed one RTP packet (optionally with an RTSP interleaved prefix).
    pub fn input_rtp(&self, data: &[u8], peer: SocketAddr) -> RtpInput {
        let _enter = self.span.enter();

        let first = {
            let mut inner = lock_or_recover(&self.inner);
            inner.stats.packets_received += 1;
            match inner.state {
                SessionState::Unbound => {
                    inner.peer = Some(peer);
                    inner.state = SessionState::AuthPending;
                    debug!(%peer, "bound to address");
                    true
                }
                SessionState::Closed => return RtpInput::DROPPED,
                _ => false,
            }
        };
        if first {
            // Without the lock: the authority may complete synchronously.
            self.emit_on_publish(peer);
        }

        let (input, queued) = {
            let mut inner = lock_or_recover(&self.inner);
            if inner.state != SessionState::Active {
                inner.stats.dropped_unauthorized += 1;
                return RtpInput::DROPPED;
            }
            if self.config.rtp_proxy.check_source && inner.peer != Some(peer) {
                inner.stats.dropped_address += 1;
                debug!(%peer, latched = ?inner.peer, "address mismatch, packet dropped");
                return RtpInput::DROPPED;
            }

            inner.total_bytes += data.len() as u64;
            let now = self.collab.clock.now();
            inner.last_active = now;
            inner.last_accepted = Some(now);

            let accepted = inner.handle_rtp(strip_interleaved(data), self.identity.ssrc);
            let input = RtpInput {
                accepted,
                dts: inner.last_dts,
            };
            (input, !inner.outputs.is_empty())
        };
        if queued {
            // Delivers the queue unless another caller holds the publisher,
            // in which case that caller does.
            self.with_publisher(|_| ());
        }
        input
    }

    fn emit_on_publish(&self, peer: SocketAddr) {
        let weak = self.weak_self.clone();
        let invoker = PublishInvoker::new(move |err: &str, options: PublishOptions| {
            match weak.upgrade() {
                Some(this) => this.on_publish_decision(err, options),
                None => debug!("session gone before publish decision"),
            }
        });
        if let Some(invoker) = self.collab.authority.on_publish(&self.identity, peer, invoker) {
            debug!("no publish authority, applying default policy");
            invoker.invoke("", self.config.general.default_publish);
        }
    }

    fn on_publish_decision(&self, err: &str, options: PublishOptions) {
        let _enter = self.span.enter();
        let listener = {
            let mut inner = lock_or_recover(&self.inner);
            if inner.state != SessionState::AuthPending {
                debug!(state = %inner.state, "late publish decision ignored");
                return;
            }
            if !err.is_empty() {
                warn!(reason = err, "RTP publish denied");
                inner.state = SessionState::Rejected;
                return;
            }
            inner.pending_listener.take()
        };

        let mut publisher = self.collab.publishers.create(&self.identity, options);
        if let Some(listener) = listener {
            publisher.set_media_listener(listener);
        }
        let readers = publisher.total_reader_count();

        {
            let mut inner = lock_or_recover(&self.inner);
            if inner.state != SessionState::AuthPending {
                debug!(state = %inner.state, "session left auth_pending while publisher was built");
                drop(inner);
                drop(publisher);
                return;
            }
            inner.state = SessionState::Active;
            inner.readers = readers;
        }
        info!(
            rtxp = options.enable_rtxp,
            hls = options.enable_hls,
            mp4 = options.enable_mp4,
            "RTP publish allowed"
        );
        self.park_publisher(publisher);
    }

    /// Run `f` on the publisher outside the session lock, then put it back.
    /// `None` when there is no publisher or another caller has it out.
    fn with_publisher<R>(&self, f: impl FnOnce(&mut dyn MediaPublisher) -> R) -> Option<R> {
        let mut publisher = lock_or_recover(&self.inner).publisher.take()?;
        let result = f(publisher.as_mut());
        self.park_publisher(publisher);
        Some(result)
    }

    /// Hand the publisher back to the session, first delivering whatever
    /// was queued and attaching any listener set in the meantime. Once the
    /// session is no longer active the publisher is dropped instead.
    fn park_publisher(&self, mut publisher: Box<dyn MediaPublisher>) {
        loop {
            let (outputs, listener) = {
                let mut inner = lock_or_recover(&self.inner);
                if inner.state != SessionState::Active {
                    inner.outputs.clear();
                    drop(inner);
                    drop(publisher);
                    return;
                }
                if inner.outputs.is_empty() && inner.pending_listener.is_none() {
                    inner.publisher = Some(publisher);
                    return;
                }
                (std::mem::take(&mut inner.outputs), inner.pending_listener.take())
            };
            if let Some(listener) = listener {
                publisher.set_media_listener(listener);
            }
            for output in outputs {
                match output {
                    PublisherOutput::Track(track) => publisher.add_track(&track),
                    PublisherOutput::Frame(frame) => publisher.input_frame(frame),
                }
            }
        }
    }

    /// Tear the session down. Pending merged video is discarded; a flow
    /// report is emitted above the configured threshold. Idempotent.
    pub fn close(&self) {
        let _enter = self.span.enter();
        let (publisher, report) = {
            let mut inner = lock_or_recover(&self.inner);
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.merger.clear();
            inner.outputs.clear();
            if let Some(dump) = inner.dump.as_mut() {
                dump.flush();
            }

            let duration_secs = inner
                .last_accepted
                .map_or(0, |t| t.saturating_duration_since(self.created_at).as_secs());
            info!(
                total_bytes = inner.total_bytes,
                duration_secs,
                packets = inner.stats.packets_accepted,
                "RTP session closed"
            );
            let report = (inner.total_bytes > self.config.flow_threshold_bytes()).then(|| FlowReport {
                identity: self.identity.clone(),
                total_bytes: inner.total_bytes,
                duration_secs,
                is_tcp: false,
                peer: inner.peer,
            });
            (inner.publisher.take(), report)
        };
        // Dropping the publisher notifies its listener.
        drop(publisher);
        if let Some(report) = report {
            self.collab.flow.on_flow_report(report);
        }
    }

    /// Whether a packet was accepted (or the session created) within the
    /// configured timeout.
    pub fn alive(&self) -> bool {
        let inner = lock_or_recover(&self.inner);
        self.collab
            .clock
            .now()
            .saturating_duration_since(inner.last_active)
            < self.config.rtp_proxy.timeout
    }

    pub fn identity(&self) -> &MediaIdentity {
        &self.identity
    }

    pub fn ssrc(&self) -> u32 {
        self.identity.ssrc
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock_or_recover(&self.inner).peer
    }

    pub fn state(&self) -> SessionState {
        lock_or_recover(&self.inner).state
    }

    /// `None` until the first chunk reached the demultiplexer.
    pub fn container_format(&self) -> Option<ContainerFormat> {
        lock_or_recover(&self.inner).demuxer.format()
    }

    /// Readers of the publisher. While the publisher is busy elsewhere, or
    /// after close, this is the last count it reported.
    pub fn total_reader_count(&self) -> usize {
        match self.with_publisher(|p| p.total_reader_count()) {
            Some(readers) => {
                lock_or_recover(&self.inner).readers = readers;
                readers
            }
            None => lock_or_recover(&self.inner).readers,
        }
    }

    /// Attach a listener to the publisher, or keep it until the publisher
    /// exists.
    pub fn set_listener(&self, listener: Weak<dyn MediaListener>) {
        lock_or_recover(&self.inner).pending_listener = Some(listener);
        self.with_publisher(|_| ());
    }

    pub fn total_bytes(&self) -> u64 {
        lock_or_recover(&self.inner).total_bytes
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let readers = self.total_reader_count();
        let inner = lock_or_recover(&self.inner);
        let idle = self
            .collab
            .clock
            .now()
            .saturating_duration_since(inner.last_active);
        SessionSnapshot {
            identity: self.identity.clone(),
            state: inner.state,
            peer: inner.peer,
            format: inner.demuxer.format(),
            tracks: inner.tracks.tracks().copied().collect(),
            readers,
            buffered_bytes: inner.assembler.pending_len() + inner.merger.buffered_bytes(),
            idle_ms: idle.as_millis() as u64,
            alive: idle < self.config.rtp_proxy.timeout,
            stats: inner.stats.clone(),
        }
    }
}

impl Drop for RtpProcess {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RtpProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpProcess")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

// ─── Data path ───────────────────────────────────────────────────────────────

impl ProcessInner {
    /// Returns whether the packet was valid for this session.
    fn handle_rtp(&mut self, data: &[u8], ssrc: u32) -> bool {
        let pkt = match RtpPacket::parse(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                self.stats.dropped_invalid += 1;
                debug!(error = %e, len = data.len(), "invalid RTP packet");
                return false;
            }
        };
        if pkt.ssrc != ssrc {
            self.stats.dropped_ssrc += 1;
            warn!(got = format_args!("{:08X}", pkt.ssrc), "SSRC mismatch, packet dropped");
            return false;
        }
        self.stats.packets_accepted += 1;
        self.stats.bytes_accepted += data.len() as u64;

        if let Some(expected) = self.sequence.observe(pkt.sequence) {
            self.stats.sequence_gaps += 1;
            warn!(expected, got = pkt.sequence, "RTP sequence discontinuity");
        }
        if let Some(dump) = self.dump.as_mut() {
            dump.write_rtp(data);
        }

        let mut chunks: Vec<PayloadChunk> = Vec::with_capacity(2);
        self.assembler.push(&pkt, |chunk| chunks.push(chunk));
        self.stats.chunks_forced = self.assembler.forced_flushes();
        for chunk in chunks {
            self.handle_chunk(chunk);
        }
        true
    }

    fn handle_chunk(&mut self, chunk: PayloadChunk) {
        self.stats.chunks += 1;
        if let Some(dump) = self.dump.as_mut() {
            dump.write_container(&chunk.data);
        }
        let before = self.demuxer.desyncs();
        self.demuxer.input(&chunk.data, chunk.packet_lost);
        self.stats.demux_desyncs += self.demuxer.desyncs() - before;
        self.stats.units_discarded = self.demuxer.discarded_units();

        while let Ok(unit) = self.decoded.try_recv() {
            self.on_decode(unit);
        }
    }

    fn on_decode(&mut self, unit: DecodedUnit) {
        self.stats.units_decoded += 1;
        let (dts, pts) = self.stamps.revise(
            unit.codec,
            unit.dts / TICKS_PER_MS,
            unit.pts / TICKS_PER_MS,
        );
        let (dts, pts) = (wire_ms(dts), wire_ms(pts));

        let observation = self.tracks.observe_id(unit.codec);
        match observation {
            Observation::Created(track) => self.outputs.push(PublisherOutput::Track(track)),
            Observation::Accepted => {}
            Observation::Rejected { .. } => self.stats.units_rejected += 1,
            Observation::Unsupported | Observation::Ignored => self.stats.units_dropped += 1,
        }
        if !observation.forwards() {
            return;
        }

        let codec = Codec::from_id(unit.codec);
        self.last_dts = Some(dts);
        match codec.media_kind() {
            Some(MediaKind::Video) => {
                let keyframe = unit.is_keyframe();
                let outputs = &mut self.outputs;
                let dump = &mut self.dump;
                let stats = &mut self.stats;
                let frag = Fragment {
                    dts,
                    pts,
                    keyframe,
                    data: unit.data,
                };
                self.merger.input(frag, |merged| {
                    if let Some(dump) = dump.as_mut() {
                        dump.write_video(&merged.data);
                    }
                    let frame = Frame::video(codec, merged.dts, merged.pts, merged.keyframe, merged.data);
                    stats.frames_out += 1;
                    outputs.push(PublisherOutput::Frame(frame));
                });
            }
            Some(MediaKind::Audio) => {
                self.stats.frames_out += 1;
                self.outputs
                    .push(PublisherOutput::Frame(Frame::audio(codec, dts, unit.data)));
            }
            None => {}
        }
    }
}

/// Corrected timestamps go out as 32-bit milliseconds and wrap after about
/// 49.7 days, like the RTMP/FLV timestamps the publisher produces.
fn wire_ms(ms: i64) -> u32 {
    ms.rem_euclid(1 << 32) as u32
}
