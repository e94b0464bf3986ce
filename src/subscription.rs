//! # Subscription Registry
//!
//! Push subscriptions over a predicate. Callbacks are registered under the
//! canonical encoding of their predicate (identical predicates share a
//! group) and invoked by the projector inside the same applied step as the
//! event itself — a notification for sequence `s` always completes before
//! barrier waiters for `s` are released.
//!
//! Payload rules (see the predicate evaluator for matching):
//!
//! - PUT: fires iff the predicate matches the post-state document; the
//!   callback receives the projected document and its metadata.
//! - DELETE: fires unconditionally, receiving the pre-state document
//!   (`old_data`) and no metadata, so consumers see deletions for keys they
//!   previously matched.
//!
//! Callbacks must be non-blocking; they run on the projector task and slow
//! callbacks delay projection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::predicate;
use crate::types::{Event, EventKind, MetaData, Record};

/// Subscriber callback: `(id, payload, meta, event)`.
pub type SubscriberFn =
    dyn Fn(&str, Option<&JsonValue>, Option<&MetaData>, &Event) + Send + Sync;

/// Predicate-keyed callback registry for one base.
pub struct SubscriptionRegistry {
    inner: Mutex<HashMap<String, PredicateGroup>>,
    active: AtomicUsize,
    next_token: AtomicU64,
}

struct PredicateGroup {
    predicate: JsonValue,
    sinks: Vec<(u64, Arc<SubscriberFn>)>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            next_token: AtomicU64::new(1),
        })
    }

    /// Registers a callback under the canonical form of `query`.
    ///
    /// The returned handle deregisters this exact callback on `dispose` (or
    /// drop). Identical predicates share one evaluation per event.
    pub fn register(
        self: &Arc<Self>,
        query: JsonValue,
        callback: Arc<SubscriberFn>,
    ) -> Result<Subscription> {
        let key = predicate::canonical(&query)?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut groups = self.inner.lock().expect("registry lock poisoned");
            groups
                .entry(key.clone())
                .or_insert_with(|| PredicateGroup {
                    predicate: query,
                    sinks: Vec::new(),
                })
                .sinks
                .push((token, callback));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Subscription {
            registry: Arc::downgrade(self),
            key,
            token,
            disposed: AtomicBool::new(false),
        })
    }

    fn deregister(&self, key: &str, token: u64) {
        let removed = {
            let mut groups = self.inner.lock().expect("registry lock poisoned");
            match groups.get_mut(key) {
                Some(group) => {
                    let before = group.sinks.len();
                    group.sinks.retain(|(t, _)| *t != token);
                    let removed = group.sinks.len() != before;
                    if group.sinks.is_empty() {
                        groups.remove(key);
                    }
                    removed
                }
                None => false,
            }
        };
        if removed {
            // Clamped at zero.
            let _ = self
                .active
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }

    /// Number of live subscriptions on this base.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Fans an applied event out to matching subscribers; returns the
    /// number of callbacks invoked.
    ///
    /// `after` is the post-state record for PUT, `None` for DELETE.
    pub fn notify(&self, event: &Event, after: Option<&Record>) -> usize {
        // Snapshot matching sinks under the lock, invoke outside it so a
        // callback may register or dispose subscriptions.
        let matched: Vec<Arc<SubscriberFn>> = {
            let groups = self.inner.lock().expect("registry lock poisoned");
            groups
                .values()
                .filter(|group| match (event.kind, after) {
                    (EventKind::Put, Some(record)) => {
                        predicate::matches(&record.data, &group.predicate)
                    }
                    // DELETE fires for every subscriber.
                    (EventKind::Delete, _) => true,
                    _ => false,
                })
                .flat_map(|group| group.sinks.iter().map(|(_, cb)| Arc::clone(cb)))
                .collect()
        };

        for callback in &matched {
            match (event.kind, after) {
                (EventKind::Put, Some(record)) => {
                    callback(&event.id, Some(&record.data), Some(&record.meta), event)
                }
                _ => callback(&event.id, event.old_data.as_ref(), None, event),
            }
        }
        matched.len()
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Opaque dispose token for one registered callback.
///
/// Dropping the handle deregisters as well; `dispose` makes the intent
/// explicit. Deregistration is idempotent.
pub struct Subscription {
    registry: Weak<SubscriptionRegistry>,
    key: String,
    token: u64,
    disposed: AtomicBool,
}

impl Subscription {
    /// Deregisters the callback. After this returns, the callback is never
    /// invoked again.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            if let Some(registry) = self.registry.upgrade() {
                registry.deregister(&self.key, self.token);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

// =============================================================================
// Tests
// =============================================================================
