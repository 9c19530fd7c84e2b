//! Deferred work queue.
//!
//! Some operations (releasing a fallen-back connection, completing a
//! JOIN) can be triggered from contexts that must not take the
//! master-connection lock — the kernel original runs them from interrupt
//! context and bounces them to a worker. Here both call sites push a job
//! onto this queue; the owner drains it from a context that may lock.

use crate::join::FourTuple;

/// A unit of deferred work, carrying only identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredJob {
    /// Release the connection registered under `token` (fallback path).
    ReleaseMpcb { token: u32 },

    /// Finish a JOIN handshake whose final ACK already arrived.
    CompleteJoin { key: FourTuple },
}

/// Single-consumer queue of [`DeferredJob`]s.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: flume::Sender<DeferredJob>,
    rx: flume::Receiver<DeferredJob>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Enqueue a job. Never blocks.
    pub fn push(&self, job: DeferredJob) {
        // The queue is unbounded and the receiver lives as long as self.
        let _ = self.tx.send(job);
    }

    /// Drain every queued job into `f`.
    ///
    /// The caller runs this from a context that may take the
    /// master-connection lock.
    pub fn drain(&self, mut f: impl FnMut(DeferredJob)) {
        for job in self.rx.try_iter() {
            f(job);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }
}
