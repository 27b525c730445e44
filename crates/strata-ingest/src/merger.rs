//! # Frame Merger
//!
//! Coalesces consecutive video fragments that share a decode timestamp
//! (the NAL units or PES pieces of one access unit) into one buffer. The
//! group is emitted when a fragment with a different dts arrives.

use bytes::{Bytes, BytesMut};

/// A fragment, or a merged group of fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub dts: u32,
    pub pts: u32,
    pub keyframe: bool,
    pub data: Bytes,
}

#[derive(Debug, Default)]
pub struct FrameMerger {
    pending: Vec<Fragment>,
    buffered_bytes: usize,
}

impl FrameMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `frag`, first emitting the pending group if its dts differs.
    pub fn input(&mut self, frag: Fragment, mut emit: impl FnMut(Fragment)) {
        if self.pending.first().is_some_and(|head| head.dts != frag.dts) {
            emit(self.take());
        }
        self.buffered_bytes += frag.data.len();
        self.pending.push(frag);
    }

    /// Drop the pending group without emitting it.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.buffered_bytes = 0;
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    fn take(&mut self) -> Fragment {
        let total = std::mem::take(&mut self.buffered_bytes);
        let mut frags = std::mem::take(&mut self.pending);
        if frags.len() == 1 {
            if let Some(single) = frags.pop() {
                return single;
            }
        }
        let keyframe = frags.iter().any(|f| f.keyframe);
        let (dts, pts) = frags.last().map_or((0, 0), |f| (f.dts, f.pts));
        let mut data = BytesMut::with_capacity(total);
        for f in &frags {
            data.extend_from_slice(&f.data);
        }
        Fragment {
            dts,
            pts,
            keyframe,
            data: data.freeze(),
        }
    }
}
