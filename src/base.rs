//! # Base
//!
//! The key–value façade over one log stream. Reads come straight from the
//! local projection; every mutation is framed as an event, published to the
//! log, awaited on the sequence barrier, and read back from the freshly
//! projected state — so a returned write is visible to every subsequent
//! read, on this instance and (once their projectors catch up) on every
//! other instance bound to the same stream.
//!
//! ```text
//! put ──► publish event ──► log assigns seq ──► barrier.wait(seq)
//!                                │                      ▲
//!                                ▼                      │ release
//!                            Projector ── apply ── notify subscribers
//!                                │
//!                                ▼
//!                        local store (db / meta / settings)
//! ```
//!
//! A `Base` is a cheap-to-clone handle; all clones share one projector,
//! one local store, and one subscription registry.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::barrier::SequenceBarrier;
use crate::error::{Error, Result};
use crate::log::{EventLog, LogServer};
use crate::projector::{spawn_projector, EventHook, ProjectorConfig, ProjectorHandle};
use crate::stats::{StatsEmitter, StatsEvent, StatsOperation};
use crate::store::{DocStore, QueryOptions, StoreHandle};
use crate::subject;
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::types::{now_ms, Event, MetaData, Record};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for one base.
#[derive(Clone, Default)]
pub struct BaseConfig {
    /// Log stream identity; also the subject prefix.
    pub stream_name: String,

    /// Enables stats publishing on the named stream.
    pub stats_stream_name: Option<String>,

    /// Local store root; defaults to a process-local temp directory.
    pub db_path: Option<PathBuf>,

    /// Hook fired in projection order for every applied event.
    pub on_message: Option<EventHook>,
}

impl BaseConfig {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Default::default()
        }
    }
}

/// Local store root used when none is configured.
pub fn default_db_path() -> PathBuf {
    std::env::temp_dir().join("basedb")
}

// =============================================================================
// Base
// =============================================================================

/// One logical key–value store bound to one log stream.
#[derive(Clone)]
pub struct Base {
    inner: Arc<BaseInner>,
}

struct BaseInner {
    stream: String,
    data_dir: PathBuf,
    log: Arc<dyn EventLog>,
    store: StoreHandle,
    registry: Arc<SubscriptionRegistry>,
    barrier: Arc<SequenceBarrier>,
    stats: Option<StatsEmitter>,
    closed: AtomicBool,
    faulted: Arc<AtomicBool>,
    last_accessed: AtomicI64,
    projector: Mutex<Option<ProjectorHandle>>,
}

impl Base {
    /// Opens a base: creates/binds the log stream, opens the local store,
    /// starts the projector, and waits until replay has caught up to the
    /// stream's sequence at startup.
    pub async fn open(server: Arc<dyn LogServer>, config: BaseConfig) -> Result<Base> {
        let root = config.db_path.clone().unwrap_or_else(default_db_path);
        let data_dir = root.join(&config.stream_name);

        let log = server.open_stream(&config.stream_name).await?;
        let store = StoreHandle::new(DocStore::open(&data_dir, &config.stream_name)?);
        let registry = SubscriptionRegistry::new();
        let barrier = Arc::new(SequenceBarrier::new());
        let stats = match &config.stats_stream_name {
            Some(name) => Some(StatsEmitter::new(server.open_stream(name).await?, name)),
            None => None,
        };

        let mut handle = spawn_projector(ProjectorConfig {
            stream: config.stream_name.clone(),
            log: Arc::clone(&log),
            store: store.clone(),
            registry: Arc::clone(&registry),
            barrier: Arc::clone(&barrier),
            on_event: config.on_message.clone(),
            stats: stats.clone(),
        })
        .await?;
        handle.ready().await?;
        debug!(stream = %config.stream_name, "base open");

        let faulted = handle.faulted_flag();
        Ok(Base {
            inner: Arc::new(BaseInner {
                stream: config.stream_name,
                data_dir,
                log,
                store,
                registry,
                barrier,
                stats,
                closed: AtomicBool::new(false),
                faulted,
                last_accessed: AtomicI64::new(now_ms()),
                projector: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Rejects operations on a closed or faulted base and refreshes the
    /// idle clock.
    fn guard(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) || self.inner.faulted.load(Ordering::SeqCst) {
            return Err(Error::InstanceClosed);
        }
        self.inner.last_accessed.store(now_ms(), Ordering::SeqCst);
        Ok(())
    }

    async fn emit(&self, event: StatsEvent) {
        if let Some(stats) = &self.inner.stats {
            stats.emit(event).await;
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the record for a live key, or `None`. Local store only; no
    /// log round-trip.
    pub async fn get(&self, id: &str) -> Result<Option<Record>> {
        self.guard()?;
        let started = Instant::now();
        let record = self.inner.store.get(id).await?;
        self.emit(StatsEvent::finished(StatsOperation::Get, started).with_id(id))
            .await;
        Ok(record)
    }

    /// Enumerates identifiers, optionally filtered by a regex pattern
    /// (unanchored match). Order is unspecified.
    pub async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        self.guard()?;
        let started = Instant::now();
        let keys = self.inner.store.keys(pattern.map(str::to_string)).await?;
        self.emit(
            StatsEvent::finished(StatsOperation::Keys, started)
                .with_pattern(pattern)
                .with_result_count(keys.len() as u64),
        )
        .await;
        Ok(keys)
    }

    /// Runs a predicate query against the local store.
    pub async fn query(&self, query: &JsonValue, options: QueryOptions) -> Result<Vec<JsonValue>> {
        self.guard()?;
        let started = Instant::now();
        let docs = self.inner.store.query(query.clone(), options).await?;
        self.emit(
            StatsEvent::finished(StatsOperation::Query, started)
                .with_query(query)
                .with_result_count(docs.len() as u64),
        )
        .await;
        Ok(docs)
    }

    /// Number of documents matching the predicate.
    pub async fn count(&self, query: &JsonValue) -> Result<u64> {
        self.guard()?;
        let started = Instant::now();
        let count = self.inner.store.count(query.clone()).await?;
        self.emit(
            StatsEvent::finished(StatsOperation::Query, started)
                .with_query(query)
                .with_result_count(count),
        )
        .await;
        Ok(count)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Stores `data` under `id`: publish, await projection, read back,
    /// then compact the key's PUT history down to the latest entry.
    pub async fn put(&self, id: &str, data: JsonValue) -> Result<Record> {
        self.guard()?;
        let started = Instant::now();

        let event = Event::put(id, data);
        let put_subject = subject::put_subject(&self.inner.stream, id);
        let seq = self.inner.log.publish(&put_subject, event.to_bytes()?).await?;
        self.inner.barrier.wait(seq).await?;

        let record = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::ProjectionMissing { id: id.to_string() })?;

        // Keep-latest compaction is best effort; the write already
        // succeeded.
        if let Err(e) = self.inner.log.purge_subject(&put_subject, 1).await {
            warn!(stream = %self.inner.stream, id, error = %e, "put compaction failed");
        }

        self.emit(StatsEvent::finished(StatsOperation::Put, started).with_id(id))
            .await;
        Ok(record)
    }

    /// Stores `data` under a fresh collision-resistant identifier.
    pub async fn insert(&self, data: JsonValue) -> Result<(String, Record)> {
        let id = Uuid::new_v4().to_string();
        let record = self.put(&id, data).await?;
        Ok((id, record))
    }

    /// Deletes `id` and purges its PUT history from the log. Returns the
    /// number of log entries removed.
    pub async fn delete(&self, id: &str) -> Result<u64> {
        self.guard()?;
        let started = Instant::now();

        let event = Event::delete(id);
        let delete_subject = subject::delete_subject(&self.inner.stream, id);
        let seq = self
            .inner
            .log
            .publish(&delete_subject, event.to_bytes()?)
            .await?;
        self.inner.barrier.wait(seq).await?;

        let purged = self
            .inner
            .log
            .purge_subject(&subject::put_subject(&self.inner.stream, id), 0)
            .await?;

        self.emit(StatsEvent::finished(StatsOperation::Delete, started).with_id(id))
            .await;
        Ok(purged)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Registers a callback fired for every projected event whose
    /// post-state matches `query` (PUTs) and for every deletion.
    ///
    /// The handle deregisters on `dispose` (or drop). Callbacks run on the
    /// projector task and must not block. In-flight callbacks may be
    /// dropped at `close`; close does not drain.
    pub async fn subscribe<F>(&self, query: JsonValue, callback: F) -> Result<Subscription>
    where
        F: Fn(&str, Option<&JsonValue>, Option<&MetaData>, &Event) + Send + Sync + 'static,
    {
        self.guard()?;
        let started = Instant::now();
        let subscription = self
            .inner
            .registry
            .register(query.clone(), Arc::new(callback))?;
        self.emit(StatsEvent::finished(StatsOperation::Subscribe, started).with_query(&query))
            .await;
        Ok(subscription)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Closes the base: stops the projector, fails pending barrier waiters,
    /// releases the log session. Every later operation (including a second
    /// `close`) fails with [`Error::InstanceClosed`].
    pub async fn close(&self) -> Result<()> {
        self.guard()?;
        self.inner.closed.store(true, Ordering::SeqCst);
        self.shutdown();
        debug!(stream = %self.inner.stream, "base closed");
        Ok(())
    }

    /// Purges and deletes the log stream, closes local resources, and
    /// removes the on-disk data directory. Terminal.
    pub async fn delete_stream(&self) -> Result<()> {
        self.guard()?;
        self.inner.closed.store(true, Ordering::SeqCst);
        self.shutdown();
        self.inner.log.delete_stream().await?;
        tokio::fs::remove_dir_all(&self.inner.data_dir).await?;
        debug!(stream = %self.inner.stream, "stream deleted");
        Ok(())
    }

    fn shutdown(&self) {
        if let Some(handle) = self
            .inner
            .projector
            .lock()
            .expect("projector lock poisoned")
            .take()
        {
            handle.abort();
        }
        self.inner.barrier.close();
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// The stream this base is bound to.
    pub fn stream_name(&self) -> &str {
        &self.inner.stream
    }

    /// Epoch milliseconds of the most recent public operation.
    pub fn last_accessed(&self) -> i64 {
        self.inner.last_accessed.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.active_count()
    }

    /// Whether `close` or `delete_stream` ran, or the projector faulted.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.inner.faulted.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Tests
// =============================================================================
