//! # Sequence Barrier
//!
//! A waitable map from published sequence numbers to local observers.
//! Writers publish an event, learn its log-assigned sequence, and park on
//! the barrier; the projector releases every waiter whose target is at or
//! below the sequence it just applied. This is what makes writes
//! read-your-writes consistent with the log order.
//!
//! Waiters with the same or lower target share a release; no ordering is
//! implied between them. Closing the barrier fails all outstanding waiters
//! with `InstanceClosed`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::types::Seq;

/// Instance-scoped barrier between a base's writers and its projector.
pub struct SequenceBarrier {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Highest sequence the projector has applied.
    applied: Seq,

    /// Whether the owning base has closed.
    closed: bool,

    /// Parked waiters, keyed by their target sequence.
    waiters: BTreeMap<u64, Vec<oneshot::Sender<Result<Seq>>>>,
}

impl SequenceBarrier {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                applied: Seq::ZERO,
                closed: false,
                waiters: BTreeMap::new(),
            }),
        }
    }

    /// Waits until the projector has applied an event with sequence ≥ `seq`.
    ///
    /// Resolves immediately if that already happened. Returns the sequence
    /// that satisfied the wait (≥ `seq`). Fails with [`Error::InstanceClosed`]
    /// if the barrier closes first.
    pub async fn wait(&self, seq: Seq) -> Result<Seq> {
        let rx = {
            let mut inner = self.inner.lock().expect("barrier lock poisoned");
            if inner.closed {
                return Err(Error::InstanceClosed);
            }
            if inner.applied >= seq {
                return Ok(inner.applied);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(seq.as_raw()).or_default().push(tx);
            rx
        };
        // Sender dropped without a value means the barrier went away.
        rx.await.map_err(|_| Error::InstanceClosed)?
    }

    /// Releases every waiter with target ≤ `applied`.
    ///
    /// Called by the projector after fully applying an event. The applied
    /// watermark is monotone; stale releases are ignored.
    pub fn release(&self, applied: Seq) {
        let released = {
            let mut inner = self.inner.lock().expect("barrier lock poisoned");
            if applied > inner.applied {
                inner.applied = applied;
            }
            let still_waiting = inner.waiters.split_off(&applied.next().as_raw());
            std::mem::replace(&mut inner.waiters, still_waiting)
        };
        for (_, senders) in released {
            for tx in senders {
                let _ = tx.send(Ok(applied));
            }
        }
    }

    /// Fails all outstanding waiters and rejects future ones.
    pub fn close(&self) {
        let drained = {
            let mut inner = self.inner.lock().expect("barrier lock poisoned");
            inner.closed = true;
            std::mem::take(&mut inner.waiters)
        };
        for (_, senders) in drained {
            for tx in senders {
                let _ = tx.send(Err(Error::InstanceClosed));
            }
        }
    }

    /// Number of parked waiters.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock().expect("barrier lock poisoned");
        inner.waiters.values().map(Vec::len).sum()
    }
}

impl Default for SequenceBarrier {
    fn default() -> Self {
        Self::new()
    }
}
