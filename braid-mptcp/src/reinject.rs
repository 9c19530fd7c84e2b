//! Reinjection engine.
//!
//! When a subflow is declared potentially failed, the meta segments
//! still sitting in its retransmit view are cloned here so the
//! scheduler can place them on a surviving path. Originals stay with
//! the failed subflow; if it recovers and delivers late, the receiver
//! drops the duplicates.

use std::collections::VecDeque;

use braid_core::segment::Segment;
use braid_core::seq;
use tracing::debug;

/// Per-connection queue of segments awaiting reinjection. The send path
/// drains this before the regular send queue.
#[derive(Debug, Default)]
pub struct ReinjectQueue {
    segs: VecDeque<Segment>,
}

impl ReinjectQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            segs: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    /// Clone the retransmit view of a failed subflow into this queue.
    ///
    /// A segment whose path mask already covers every eligible subflow
    /// is skipped: no path is left that could usefully repeat it. The
    /// clone keeps the original's mask so the scheduler will not put it
    /// back on a path that already carries it.
    pub fn harvest(&mut self, rtx: &VecDeque<Segment>, eligible_mask: u32) {
        let mut cloned = 0usize;
        for seg in rtx {
            if eligible_mask != 0 && seg.path_mask & eligible_mask == eligible_mask {
                continue;
            }
            if self
                .segs
                .iter()
                .any(|q| q.data_seq == seg.data_seq && q.end_data_seq == seg.end_data_seq)
            {
                continue;
            }
            self.segs.push_back(seg.clone());
            cloned += 1;
        }
        if cloned > 0 {
            debug!(cloned, queued = self.segs.len(), "segments queued for reinjection");
        }
    }

    /// Next segment to reinject.
    pub fn pop(&mut self) -> Option<Segment> {
        self.segs.pop_front()
    }

    /// Put a segment back when no subflow would take it.
    pub fn push_front(&mut self, seg: Segment) {
        self.segs.push_front(seg);
    }

    /// Drop everything already covered by a data-level acknowledgment.
    pub fn prune_acked(&mut self, data_ack: u32) {
        self.segs
            .retain(|s| seq::after(s.end_data_seq, data_ack));
    }
}
