//! # Publishing Collaborators
//!
//! The session pipeline talks to the outside world through the traits in
//! this module, all handed in at construction:
//!
//! - [`PublisherFactory`] / [`MediaPublisher`]: where frames go once the
//!   stream is authorized
//! - [`PublishAuthority`]: decides whether a new stream may publish
//! - [`FlowReporter`]: receives the traffic summary at teardown
//!
//! [`ChannelPublisherFactory`] forwards everything over a crossbeam channel
//! and is what the binary and the tests plug in.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use tracing::info;

use crate::frame::Frame;
use crate::rtp::ssrc_to_stream_id;
use crate::track::Track;

pub const RTP_SCHEMA: &str = "rtp";
pub const DEFAULT_VHOST: &str = "__defaultVhost__";
pub const RTP_APP: &str = "rtp";

// ─── Identity ────────────────────────────────────────────────────────────────

/// Who a session publishes as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MediaIdentity {
    pub ssrc: u32,
    pub stream_id: String,
    pub schema: &'static str,
    pub vhost: &'static str,
    pub app: &'static str,
}

impl MediaIdentity {
    pub fn for_ssrc(ssrc: u32) -> Self {
        Self {
            ssrc,
            stream_id: ssrc_to_stream_id(ssrc),
            schema: RTP_SCHEMA,
            vhost: DEFAULT_VHOST,
            app: RTP_APP,
        }
    }
}

impl fmt::Display for MediaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}/{}", self.schema, self.vhost, self.app, self.stream_id)
    }
}

// ─── Publisher ───────────────────────────────────────────────────────────────

/// Delivery protocols the publisher should enable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishOptions {
    pub enable_rtxp: bool,
    pub enable_hls: bool,
    pub enable_mp4: bool,
}

/// Reader/lifecycle notifications from the publisher back to the host.
pub trait MediaListener: Send + Sync {
    fn on_reader_changed(&self, _identity: &MediaIdentity, _readers: usize) {}
    fn on_close(&self, _identity: &MediaIdentity) {}
}

/// Downstream multi-protocol publisher of one stream.
pub trait MediaPublisher: Send {
    fn add_track(&mut self, track: &Track);
    fn input_frame(&mut self, frame: Frame);
    fn total_reader_count(&self) -> usize;
    fn set_media_listener(&mut self, listener: Weak<dyn MediaListener>);
}

pub trait PublisherFactory: Send + Sync {
    fn create(&self, identity: &MediaIdentity, options: PublishOptions) -> Box<dyn MediaPublisher>;
}

// ─── Authorization ───────────────────────────────────────────────────────────

/// One-shot completion of a publish request. An empty `err` allows the
/// stream with the given options; anything else rejects it.
pub struct PublishInvoker {
    complete: Box<dyn FnOnce(&str, PublishOptions) + Send>,
}

impl PublishInvoker {
    pub fn new(complete: impl FnOnce(&str, PublishOptions) + Send + 'static) -> Self {
        Self {
            complete: Box::new(complete),
        }
    }

    pub fn invoke(self, err: &str, options: PublishOptions) {
        (self.complete)(err, options)
    }
}

impl fmt::Debug for PublishInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PublishInvoker")
    }
}

pub trait PublishAuthority: Send + Sync {
    /// Take ownership of `invoker` and complete it now or later, from any
    /// thread. Return it untouched when nobody decides on publishing; the
    /// session then applies its default policy.
    fn on_publish(
        &self,
        identity: &MediaIdentity,
        peer: SocketAddr,
        invoker: PublishInvoker,
    ) -> Option<PublishInvoker>;
}

/// No listener: every stream gets the default policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthority;

impl PublishAuthority for NoAuthority {
    fn on_publish(
        &self,
        _identity: &MediaIdentity,
        _peer: SocketAddr,
        invoker: PublishInvoker,
    ) -> Option<PublishInvoker> {
        Some(invoker)
    }
}

// ─── Flow accounting ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowReport {
    pub identity: MediaIdentity,
    pub total_bytes: u64,
    pub duration_secs: u64,
    pub is_tcp: bool,
    pub peer: Option<SocketAddr>,
}

pub trait FlowReporter: Send + Sync {
    fn on_flow_report(&self, report: FlowReport);
}

/// Writes flow reports to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFlowReporter;

impl FlowReporter for LogFlowReporter {
    fn on_flow_report(&self, report: FlowReport) {
        info!(
            stream = %report.identity,
            total_bytes = report.total_bytes,
            duration_secs = report.duration_secs,
            peer = ?report.peer,
            "flow report"
        );
    }
}

/// Forwards flow reports over a channel.
impl FlowReporter for Sender<FlowReport> {
    fn on_flow_report(&self, report: FlowReport) {
        let _ = self.send(report);
    }
}

// ─── Channel publisher ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum PublishEvent {
    Created {
        identity: MediaIdentity,
        options: PublishOptions,
    },
    TrackAdded {
        identity: MediaIdentity,
        track: Track,
    },
    Frame {
        identity: MediaIdentity,
        frame: Frame,
    },
    ListenerAttached {
        identity: MediaIdentity,
    },
}

/// Builds [`ChannelPublisher`]s that share one event channel and one
/// reader counter.
#[derive(Debug, Clone)]
pub struct ChannelPublisherFactory {
    tx: Sender<PublishEvent>,
    readers: Arc<AtomicUsize>,
}

impl ChannelPublisherFactory {
    pub fn new() -> (Self, Receiver<PublishEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Self {
                tx,
                readers: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Reader count reported by every publisher from this factory.
    pub fn set_readers(&self, readers: usize) {
        self.readers.store(readers, Ordering::Relaxed);
    }
}

impl PublisherFactory for ChannelPublisherFactory {
    fn create(&self, identity: &MediaIdentity, options: PublishOptions) -> Box<dyn MediaPublisher> {
        let _ = self.tx.send(PublishEvent::Created {
            identity: identity.clone(),
            options,
        });
        Box::new(ChannelPublisher {
            identity: identity.clone(),
            tx: self.tx.clone(),
            readers: self.readers.clone(),
            listener: None,
        })
    }
}

pub struct ChannelPublisher {
    identity: MediaIdentity,
    tx: Sender<PublishEvent>,
    readers: Arc<AtomicUsize>,
    listener: Option<Weak<dyn MediaListener>>,
}

impl MediaPublisher for ChannelPublisher {
    fn add_track(&mut self, track: &Track) {
        let _ = self.tx.send(PublishEvent::TrackAdded {
            identity: self.identity.clone(),
            track: *track,
        });
    }

    fn input_frame(&mut self, frame: Frame) {
        let _ = self.tx.send(PublishEvent::Frame {
            identity: self.identity.clone(),
            frame,
        });
    }

    fn total_reader_count(&self) -> usize {
        self.readers.load(Ordering::Relaxed)
    }

    fn set_media_listener(&mut self, listener: Weak<dyn MediaListener>) {
        self.listener = Some(listener);
        let _ = self.tx.send(PublishEvent::ListenerAttached {
            identity: self.identity.clone(),
        });
    }
}

impl Drop for ChannelPublisher {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.as_ref().and_then(Weak::upgrade) {
            listener.on_close(&self.identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use bytes::Bytes;
    use std::sync::Mutex;

    #[test]
    fn identity_from_ssrc() {
        let id = MediaIdentity::for_ssrc(0x0A0B_0C0D);
        assert_eq!(id.stream_id, "0A0B0C0D");
        assert_eq!(id.to_string(), "rtp://__defaultVhost__/rtp/0A0B0C0D");
    }

    #[test]
    fn no_authority_hands_invoker_back() {
        let called = Arc::new(Mutex::new(None));
        let c = called.clone();
        let invoker = PublishInvoker::new(move |err, opts| {
            *c.lock().unwrap() = Some((err.to_string(), opts));
        });
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let back = NoAuthority
            .on_publish(&MediaIdentity::for_ssrc(1), peer, invoker)
            .expect("invoker returned");
        back.invoke("", PublishOptions::default());
        assert_eq!(
            *called.lock().unwrap(),
            Some((String::new(), PublishOptions::default()))
        );
    }

    struct CloseFlag(Mutex<bool>);

    impl MediaListener for CloseFlag {
        fn on_close(&self, _identity: &MediaIdentity) {
            *self.0.lock().unwrap() = true;
        }
    }

    #[test]
    fn channel_publisher_forwards_events() {
        let (factory, rx) = ChannelPublisherFactory::new();
        let id = MediaIdentity::for_ssrc(7);
        let mut publisher = factory.create(&id, PublishOptions::default());
        factory.set_readers(3);
        assert_eq!(publisher.total_reader_count(), 3);

        let listener = Arc::new(CloseFlag(Mutex::new(false)));
        let dyn_listener: Arc<dyn MediaListener> = listener.clone();
        publisher.set_media_listener(Arc::downgrade(&dyn_listener));
        publisher.input_frame(Frame::audio(Codec::G711, 20, Bytes::from_static(&[1])));
        drop(publisher);
        assert!(*listener.0.lock().unwrap());

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events[0], PublishEvent::Created { .. }));
        assert!(matches!(events[1], PublishEvent::ListenerAttached { .. }));
        assert!(matches!(&events[2], PublishEvent::Frame { frame, .. } if frame.dts == 20));
    }
}
