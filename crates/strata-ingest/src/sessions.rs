//! # Session Table
//!
//! Host-side registry of [`RtpProcess`]es keyed by SSRC. Datagrams are
//! routed by the SSRC in their RTP header; sessions that stop receiving
//! are reaped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::IngestConfig;
use crate::process::{Collaborators, RtpInput, RtpProcess};
use crate::rtp::{peek_ssrc, ssrc_to_stream_id};
use crate::stats::SessionSnapshot;

pub struct SessionTable {
    config: Arc<IngestConfig>,
    collab: Collaborators,
    sessions: HashMap<u32, Arc<RtpProcess>>,
}

impl SessionTable {
    pub fn new(config: Arc<IngestConfig>, collab: Collaborators) -> Self {
        Self {
            config,
            collab,
            sessions: HashMap::new(),
        }
    }

    pub fn get_or_create(&mut self, ssrc: u32) -> Arc<RtpProcess> {
        self.sessions
            .entry(ssrc)
            .or_insert_with(|| {
                info!(stream = %ssrc_to_stream_id(ssrc), "new RTP session");
                RtpProcess::new(ssrc, self.config.clone(), self.collab.clone())
            })
            .clone()
    }

    pub fn get(&self, ssrc: u32) -> Option<Arc<RtpProcess>> {
        self.sessions.get(&ssrc).cloned()
    }

    /// Route one datagram. `None` when it carries no readable SSRC.
    pub fn input(&mut self, data: &[u8], peer: SocketAddr) -> Option<RtpInput> {
        let Some(ssrc) = peek_ssrc(data) else {
            debug!(%peer, len = data.len(), "datagram without RTP header ignored");
            return None;
        };
        Some(self.get_or_create(ssrc).input_rtp(data, peer))
    }

    /// Close and drop sessions that are no longer alive. Returns how many
    /// were removed.
    pub fn reap(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            let alive = session.alive();
            if !alive {
                info!(stream = %session.identity().stream_id, "RTP session timed out");
                session.close();
            }
            alive
        });
        before - self.sessions.len()
    }

    pub fn close_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.close();
        }
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut out: Vec<_> = self.sessions.values().map(|s| s.snapshot()).collect();
        out.sort_by_key(|s| s.identity.ssrc);
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
