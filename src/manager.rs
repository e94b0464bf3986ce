//! # Manager
//!
//! Owner of many bases, keyed by stream name. Opening is single-flight:
//! the in-flight open itself is stored under the name as a shared future,
//! so concurrent callers coalesce onto one `Base::open`. A periodic sweep
//! closes bases that have been idle past the keep-alive window — but never
//! one with active subscribers, however idle.
//!
//! The manager is a pure owner: bases never call back into it.
//! `stream:opened` is emitted exactly when an entry is first inserted,
//! `stream:closed` whenever the manager closes one (sweep or `close_all`).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::base::{Base, BaseConfig};
use crate::error::{Error, Result};
use crate::log::LogServer;
use crate::projector::EventHook;
use crate::types::now_ms;

// =============================================================================
// Configuration and Events
// =============================================================================

/// Maps a stream name to its stats stream, if any.
pub type StatsStreamNameFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Configuration shared by every base the manager opens.
#[derive(Clone)]
pub struct ManagerConfig {
    /// Local store root passed to each base.
    pub db_path: Option<PathBuf>,

    /// Idle window before an unsubscribed base is evicted.
    pub keep_alive: Duration,

    /// Sweep period.
    pub cleanup_interval: Duration,

    /// Hook passed to each opened base.
    pub on_message: Option<EventHook>,

    /// Per-stream stats stream naming.
    pub stats_stream_name: Option<StatsStreamNameFn>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            keep_alive: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
            on_message: None,
            stats_stream_name: None,
        }
    }
}

/// Lifecycle notifications emitted by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    Opened(String),
    Closed(String),
}

impl fmt::Display for ManagerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerEvent::Opened(name) => write!(f, "stream:opened({name})"),
            ManagerEvent::Closed(name) => write!(f, "stream:closed({name})"),
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

type OpenFuture = Shared<BoxFuture<'static, std::result::Result<Base, Arc<Error>>>>;

/// One map entry: the (possibly still in-flight) open. The generation
/// guards removal — a failed caller only evicts the slot it awaited, never
/// a fresh retry inserted meanwhile.
#[derive(Clone)]
struct BaseSlot {
    generation: u64,
    open: OpenFuture,
}

/// Multi-base owner with single-flight opens and idle eviction.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    server: Arc<dyn LogServer>,
    config: ManagerConfig,
    bases: Mutex<HashMap<String, BaseSlot>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<ManagerEvent>,
}

impl ManagerInner {
    fn bases(&self) -> MutexGuard<'_, HashMap<String, BaseSlot>> {
        self.bases.lock().expect("manager lock poisoned")
    }
}

impl Manager {
    pub fn new(server: Arc<dyn LogServer>, config: ManagerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ManagerInner {
                server,
                config,
                bases: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
                next_generation: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// Receiver for `stream:opened` / `stream:closed` notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Returns the base for `name`, opening it if needed. Concurrent
    /// callers share one open.
    pub async fn get_stream(&self, name: &str) -> Result<Base> {
        let slot = {
            let mut bases = self.inner.bases();
            let existing = bases.get(name).cloned();
            match existing {
                Some(existing) => existing,
                None => {
                    let was_empty = bases.is_empty();
                    let config = BaseConfig {
                        stream_name: name.to_string(),
                        stats_stream_name: self
                            .inner
                            .config
                            .stats_stream_name
                            .as_ref()
                            .and_then(|f| f(name)),
                        db_path: self.inner.config.db_path.clone(),
                        on_message: self.inner.config.on_message.clone(),
                    };
                    let server = Arc::clone(&self.inner.server);
                    let slot = BaseSlot {
                        generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
                        open: async move { Base::open(server, config).await.map_err(Arc::new) }
                            .boxed()
                            .shared(),
                    };
                    bases.insert(name.to_string(), slot.clone());
                    let _ = self.inner.events.send(ManagerEvent::Opened(name.to_string()));
                    if was_empty {
                        self.start_sweeper();
                    }
                    slot
                }
            }
        };

        match slot.open.clone().await {
            Ok(base) => Ok(base),
            Err(e) => {
                // Evict the failed open (and only it) so later calls retry.
                let mut bases = self.inner.bases();
                if bases
                    .get(name)
                    .is_some_and(|current| current.generation == slot.generation)
                {
                    bases.remove(name);
                }
                Err(Error::OpenFailed(e.to_string()))
            }
        }
    }

    /// Stops the sweeper, closes every base (tolerating open failures),
    /// emits `stream:closed` for each, and clears the map.
    pub async fn close_all(&self) -> Result<()> {
        self.stop_sweeper();
        let drained: Vec<(String, BaseSlot)> = self.inner.bases().drain().collect();
        for (name, slot) in drained {
            if let Ok(base) = slot.open.clone().await {
                if let Err(e) = base.close().await {
                    debug!(stream = %name, error = %e, "close_all: base already closed");
                }
            }
            let _ = self.inner.events.send(ManagerEvent::Closed(name));
        }
        Ok(())
    }

    fn start_sweeper(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.cleanup_interval;
        let keep_alive_ms = self.inner.config.keep_alive.as_millis() as i64;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                sweep(&inner, keep_alive_ms).await;
            }
        });
        let old = self
            .inner
            .sweeper
            .lock()
            .expect("sweeper lock poisoned")
            .replace(task);
        if let Some(old) = old {
            old.abort();
        }
    }

    fn stop_sweeper(&self) {
        if let Some(task) = self
            .inner
            .sweeper
            .lock()
            .expect("sweeper lock poisoned")
            .take()
        {
            task.abort();
        }
    }
}

/// One sweep pass: evict bases idle past the keep-alive window with no
/// active subscribers.
async fn sweep(inner: &ManagerInner, keep_alive_ms: i64) {
    let now = now_ms();
    let expired: Vec<(String, Base)> = {
        let mut bases = inner.bases();
        let mut expired = Vec::new();
        bases.retain(|name, slot| match slot.open.peek() {
            Some(Ok(base))
                if now - base.last_accessed() > keep_alive_ms
                    && base.active_subscriptions() == 0 =>
            {
                expired.push((name.clone(), base.clone()));
                false
            }
            _ => true,
        });
        expired
    };

    for (name, base) in expired {
        debug!(stream = %name, "evicting idle base");
        if let Err(e) = base.close().await {
            warn!(stream = %name, error = %e, "idle close failed");
        }
        let _ = inner.events.send(ManagerEvent::Closed(name));
    }
}

// =============================================================================
// Tests
// =============================================================================
