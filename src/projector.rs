//! # Projector
//!
//! The replay/tail loop. One projector task per base owns every write to
//! the local store: it reads events from the checkpoint forward, applies
//! each one atomically (document + metadata + checkpoint in one store
//! transaction), fans the event out to subscribers, and only then releases
//! barrier waiters for that sequence.
//!
//! ## Startup
//!
//! 1. Read the checkpoint (missing/invalid → 0).
//! 2. Capture the stream's `last_seq` as the catch-up target.
//! 3. Target 0 or checkpoint ≥ target: signal ready immediately.
//! 4. Consume from `checkpoint + 1`; tailing continues either way.
//! 5. Signal ready (once) when an applied sequence reaches the target.
//!
//! ## Per-Event Order
//!
//! parse → observer hook (before `old_data` is attached; panics are logged
//! and swallowed) → atomic store apply → subscriber notify → barrier
//! release → ack. A notification for sequence `s` therefore always
//! completes before a writer awaiting `s` wakes.
//!
//! ## Faults
//!
//! Any store or parse error aborts the loop without acknowledging the
//! event: the base is faulted, outstanding and future barrier waits fail,
//! and redelivery after restart re-applies the event onto the same key
//! state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::barrier::SequenceBarrier;
use crate::error::{Error, Result};
use crate::log::{EventLog, LogConsumer, LogEntry};
use crate::stats::{StatsEmitter, StatsEvent, StatsOperation};
use crate::store::StoreHandle;
use crate::subscription::SubscriptionRegistry;
use crate::types::{Event, EventKind, Record, Seq};

/// Observer hook fired in projection order for every applied event.
pub type EventHook = Arc<dyn Fn(&Event) + Send + Sync>;

/// Everything the projection loop needs.
pub struct ProjectorConfig {
    pub stream: String,
    pub log: Arc<dyn EventLog>,
    pub store: StoreHandle,
    pub registry: Arc<SubscriptionRegistry>,
    pub barrier: Arc<SequenceBarrier>,
    pub on_event: Option<EventHook>,
    pub stats: Option<StatsEmitter>,
}

/// Handle to a running projector task.
pub struct ProjectorHandle {
    task: JoinHandle<()>,
    ready_rx: watch::Receiver<bool>,
    faulted: Arc<AtomicBool>,
}

impl ProjectorHandle {
    /// Resolves once the projector has caught up to the sequence captured
    /// at startup. Fails if the projector faults first.
    pub async fn ready(&mut self) -> Result<()> {
        loop {
            if *self.ready_rx.borrow() {
                return Ok(());
            }
            if self.faulted.load(Ordering::SeqCst) {
                return Err(Error::InstanceClosed);
            }
            if self.ready_rx.changed().await.is_err() {
                // Task ended before reaching the target.
                return Err(Error::InstanceClosed);
            }
        }
    }

    /// Whether the projection loop aborted on an error.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// The shared fault flag, for owners that outlive this handle.
    pub fn faulted_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.faulted)
    }

    /// Stops the loop. The consumer is dropped with the task, so the log
    /// retains no per-consumer state.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Runs the startup protocol and spawns the projection loop.
pub async fn spawn_projector(config: ProjectorConfig) -> Result<ProjectorHandle> {
    let checkpoint = config.store.checkpoint().await?;
    let target = config.log.last_seq().await?;
    let consumer = config.log.consume(checkpoint.next()).await?;

    let (ready_tx, ready_rx) = watch::channel(false);
    let caught_up = target == Seq::ZERO || checkpoint >= target;
    if caught_up {
        ready_tx.send_replace(true);
    }
    debug!(
        stream = %config.stream,
        checkpoint = %checkpoint,
        target = %target,
        "projector starting"
    );

    let faulted = Arc::new(AtomicBool::new(false));
    let task = tokio::spawn(run_loop(
        config,
        consumer,
        target,
        ready_tx,
        caught_up,
        Arc::clone(&faulted),
    ));

    Ok(ProjectorHandle {
        task,
        ready_rx,
        faulted,
    })
}

async fn run_loop(
    config: ProjectorConfig,
    mut consumer: Box<dyn LogConsumer>,
    target: Seq,
    ready_tx: watch::Sender<bool>,
    mut ready_sent: bool,
    faulted: Arc<AtomicBool>,
) {
    loop {
        match consumer.next().await {
            Ok(Some(entry)) => {
                let seq = entry.seq;
                if let Err(e) = apply(&config, entry).await {
                    error!(
                        stream = %config.stream,
                        seq = %seq,
                        error = %e,
                        "projection failed; base faulted"
                    );
                    faulted.store(true, Ordering::SeqCst);
                    break;
                }
                if !ready_sent && seq >= target {
                    ready_tx.send_replace(true);
                    ready_sent = true;
                }
                // The event is applied and checkpointed; a failed ack only
                // risks redelivery, which projection tolerates.
                if let Err(e) = consumer.ack(seq).await {
                    warn!(stream = %config.stream, seq = %seq, error = %e, "ack failed");
                }
            }
            Ok(None) => {
                debug!(stream = %config.stream, "log consumer ended");
                faulted.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                error!(stream = %config.stream, error = %e, "log consume failed; base faulted");
                faulted.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
    // Nothing will release waiters after the loop stops.
    config.barrier.close();
}

/// Applies one log entry; atomic from a reader's perspective.
async fn apply(config: &ProjectorConfig, entry: LogEntry) -> Result<()> {
    let mut event = Event::from_bytes(&entry.payload)?;

    // The hook sees the event before old_data is attached.
    if let Some(hook) = &config.on_event {
        if catch_unwind(AssertUnwindSafe(|| hook(&event))).is_err() {
            warn!(stream = %config.stream, id = %event.id, "event observer hook panicked");
        }
    }

    let after: Option<Record> = match event.kind {
        EventKind::Put => {
            let data = event.data.clone().unwrap_or(serde_json::Value::Null);
            let (old, record) = config
                .store
                .apply_put(&event.id, data, entry.time_ms, entry.seq)
                .await?;
            event.old_data = old;
            Some(record)
        }
        EventKind::Delete => {
            event.old_data = config.store.apply_delete(&event.id, entry.seq).await?;
            None
        }
    };

    let started = Instant::now();
    let notified = config.registry.notify(&event, after.as_ref());
    if notified > 0 {
        if let Some(stats) = &config.stats {
            stats
                .emit(
                    StatsEvent::finished(StatsOperation::SubscribeEmit, started)
                        .with_id(&event.id)
                        .with_result_count(notified as u64),
                )
                .await;
        }
    }

    config.barrier.release(entry.seq);
    Ok(())
}
