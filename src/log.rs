//! # Log Collaborator Seam
//!
//! The durable, ordered event log is an external collaborator: the core
//! needs only the small JetStream-shaped contract below.
//!
//! ```text
//! LogServer ── open_stream(name) ──► EventLog (one stream, filter "name.*")
//!                                      │ publish(subject, bytes) → Seq
//!                                      │ last_seq()
//!                                      │ consume(start)          → LogConsumer
//!                                      │ purge_subject(subject, keep)
//!                                      │ delete_stream()
//!                                      ▼
//!                                    LogConsumer::next() → LogEntry { seq, subject, payload, time }
//! ```
//!
//! Contract the projector relies on:
//!
//! - `publish` assigns strictly increasing sequences within a stream.
//! - `consume(start)` yields entries with `seq ≥ start` in sequence order,
//!   skipping purged entries, then tails live publishes.
//! - `LogEntry::time_ms` is the log-authoritative receive time.
//! - `purge_subject(s, keep)` removes all but the newest `keep` entries on
//!   subject `s` and reports how many were removed.
//! - After `delete_stream`, consumers end (`next` yields `None`) and
//!   publishes fail.
//!
//! [`MemoryLogServer`] is the in-process implementation: one shared server
//! gives every base opened on the same stream name the same ordered log,
//! which is exactly what multi-instance convergence needs in tests and
//! embedded deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::types::{now_ms, Seq};

// =============================================================================
// Traits
// =============================================================================

/// One message on the log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log-assigned sequence, unique and increasing within the stream.
    pub seq: Seq,

    /// Routing subject the entry was published on.
    pub subject: String,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,

    /// Log-authoritative receive time, milliseconds since epoch.
    pub time_ms: i64,
}

/// Factory for log streams; the connection-level handle.
#[async_trait]
pub trait LogServer: Send + Sync {
    /// Opens (creating if absent) the stream `name` with subject filter
    /// `name.*`.
    async fn open_stream(&self, name: &str) -> Result<Arc<dyn EventLog>>;
}

/// One durable, append-only stream.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends a message and returns its assigned sequence.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<Seq>;

    /// The stream's highest assigned sequence (`Seq::ZERO` when empty).
    async fn last_seq(&self) -> Result<Seq>;

    /// Opens an ordered consumer starting at `start` (inclusive).
    async fn consume(&self, start: Seq) -> Result<Box<dyn LogConsumer>>;

    /// Removes all but the newest `keep` entries on `subject`; returns the
    /// number removed.
    async fn purge_subject(&self, subject: &str, keep: u64) -> Result<u64>;

    /// Purges and deletes the whole stream. Terminal.
    async fn delete_stream(&self) -> Result<()>;
}

/// An ordered reader over one stream.
#[async_trait]
pub trait LogConsumer: Send {
    /// Next entry in sequence order; waits for live publishes once caught
    /// up. `None` once the stream has been deleted.
    async fn next(&mut self) -> Result<Option<LogEntry>>;

    /// Acknowledges an applied entry.
    async fn ack(&mut self, seq: Seq) -> Result<()>;
}

// =============================================================================
// In-Memory Implementation
// =============================================================================

/// An in-process log server with JetStream semantics.
///
/// Cloning the server (or sharing it behind `Arc`) shares the underlying
/// streams: two bases opened against the same server and stream name see
/// one ordered log.
#[derive(Clone, Default)]
pub struct MemoryLogServer {
    streams: Arc<Mutex<HashMap<String, Arc<StreamShared>>>>,
}

impl MemoryLogServer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogServer for MemoryLogServer {
    async fn open_stream(&self, name: &str) -> Result<Arc<dyn EventLog>> {
        let mut streams = self.streams.lock().expect("log server lock poisoned");
        // A deleted stream name can be reused; it starts a fresh log.
        let reusable = streams
            .get(name)
            .filter(|existing| !existing.lock().deleted)
            .map(Arc::clone);
        let shared = match reusable {
            Some(existing) => existing,
            None => {
                let fresh = Arc::new(StreamShared::new(name));
                streams.insert(name.to_string(), Arc::clone(&fresh));
                fresh
            }
        };
        Ok(Arc::new(MemoryStream { shared }))
    }
}

/// Shared state of one in-memory stream: ordered entries plus a publish
/// watermark used to wake tailing consumers.
struct StreamShared {
    name: String,
    state: Mutex<StreamState>,
    publish_tx: watch::Sender<u64>,
}

struct StreamState {
    entries: BTreeMap<u64, LogEntry>,
    last_seq: u64,
    deleted: bool,
}

impl StreamShared {
    fn new(name: &str) -> Self {
        let (publish_tx, _) = watch::channel(0);
        Self {
            name: name.to_string(),
            state: Mutex::new(StreamState {
                entries: BTreeMap::new(),
                last_seq: 0,
                deleted: false,
            }),
            publish_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().expect("stream lock poisoned")
    }

    fn deleted_error(&self) -> Error {
        Error::LogUnavailable(format!("stream '{}' deleted", self.name))
    }
}

/// Handle to one in-memory stream.
pub struct MemoryStream {
    shared: Arc<StreamShared>,
}

#[async_trait]
impl EventLog for MemoryStream {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<Seq> {
        let seq = {
            let mut state = self.shared.lock();
            if state.deleted {
                return Err(self.shared.deleted_error());
            }
            state.last_seq += 1;
            let seq = state.last_seq;
            state.entries.insert(
                seq,
                LogEntry {
                    seq: Seq::from_raw(seq),
                    subject: subject.to_string(),
                    payload,
                    time_ms: now_ms(),
                },
            );
            seq
        };
        // Wake tailing consumers; nobody listening is fine.
        self.shared.publish_tx.send_replace(seq);
        Ok(Seq::from_raw(seq))
    }

    async fn last_seq(&self) -> Result<Seq> {
        let state = self.shared.lock();
        if state.deleted {
            return Err(self.shared.deleted_error());
        }
        Ok(Seq::from_raw(state.last_seq))
    }

    async fn consume(&self, start: Seq) -> Result<Box<dyn LogConsumer>> {
        Ok(Box::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            cursor: start.as_raw(),
            publish_rx: self.shared.publish_tx.subscribe(),
        }))
    }

    async fn purge_subject(&self, subject: &str, keep: u64) -> Result<u64> {
        let mut state = self.shared.lock();
        if state.deleted {
            return Err(self.shared.deleted_error());
        }
        let matching: Vec<u64> = state
            .entries
            .values()
            .filter(|e| e.subject == subject)
            .map(|e| e.seq.as_raw())
            .collect();
        // Matching sequences are in order; drop the oldest beyond `keep`.
        let excess = matching.len().saturating_sub(keep as usize);
        for seq in matching.into_iter().take(excess) {
            state.entries.remove(&seq);
        }
        Ok(excess as u64)
    }

    async fn delete_stream(&self) -> Result<()> {
        {
            let mut state = self.shared.lock();
            state.deleted = true;
            state.entries.clear();
        }
        // Wake consumers so they observe the deletion and end.
        self.shared.publish_tx.send_replace(u64::MAX);
        Ok(())
    }
}

/// Cursor-based consumer over a stream's shared state.
struct MemoryConsumer {
    shared: Arc<StreamShared>,
    cursor: u64,
    publish_rx: watch::Receiver<u64>,
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<LogEntry>> {
        loop {
            {
                let state = self.shared.lock();
                // Purged entries leave gaps; range from the cursor forward.
                if let Some((_, entry)) = state.entries.range(self.cursor..).next() {
                    self.cursor = entry.seq.as_raw() + 1;
                    return Ok(Some(entry.clone()));
                }
                if state.deleted {
                    return Ok(None);
                }
            }
            if self.publish_rx.changed().await.is_err() {
                // Stream dropped entirely.
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, _seq: Seq) -> Result<()> {
        // The in-memory log keeps no per-consumer delivery state; resume
        // position comes from the base's own checkpoint.
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn open(server: &MemoryLogServer, name: &str) -> Arc<dyn EventLog> {
        server.open_stream(name).await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_seqs() {
        let server = MemoryLogServer::new();
        let log = open(&server, "t").await;

        assert_eq!(log.last_seq().await.unwrap(), Seq::ZERO);
        assert_eq!(log.publish("t.a-put", b"1".to_vec()).await.unwrap().as_raw(), 1);
        assert_eq!(log.publish("t.b-put", b"2".to_vec()).await.unwrap().as_raw(), 2);
        assert_eq!(log.last_seq().await.unwrap().as_raw(), 2);
    }

    #[tokio::test]
    async fn test_same_name_shares_one_stream() {
        let server = MemoryLogServer::new();
        let a = open(&server, "t").await;
        let b = open(&server, "t").await;

        a.publish("t.x-put", b"hi".to_vec()).await.unwrap();
        assert_eq!(b.last_seq().await.unwrap().as_raw(), 1);
    }

    #[tokio::test]
    async fn test_consumer_replays_then_tails() {
        let server = MemoryLogServer::new();
        let log = open(&server, "t").await;

        log.publish("t.a-put", b"1".to_vec()).await.unwrap();
        log.publish("t.a-put", b"2".to_vec()).await.unwrap();

        let mut consumer = log.consume(Seq::from_raw(1)).await.unwrap();
        assert_eq!(consumer.next().await.unwrap().unwrap().seq.as_raw(), 1);
        assert_eq!(consumer.next().await.unwrap().unwrap().seq.as_raw(), 2);

        // Tail: publish from another task while the consumer waits.
        let log2 = open(&server, "t").await;
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            log2.publish("t.a-put", b"3".to_vec()).await.unwrap();
        });
        let entry = consumer.next().await.unwrap().unwrap();
        assert_eq!(entry.seq.as_raw(), 3);
        assert_eq!(entry.payload, b"3");
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_keeps_newest() {
        let server = MemoryLogServer::new();
        let log = open(&server, "t").await;

        for i in 0..5u8 {
            log.publish("t.k-put", vec![i]).await.unwrap();
        }
        log.publish("t.other-put", b"x".to_vec()).await.unwrap();

        let purged = log.purge_subject("t.k-put", 1).await.unwrap();
        assert_eq!(purged, 4);

        // Only the newest k entry (seq 5) and the other subject survive.
        let mut consumer = log.consume(Seq::from_raw(1)).await.unwrap();
        assert_eq!(consumer.next().await.unwrap().unwrap().seq.as_raw(), 5);
        assert_eq!(consumer.next().await.unwrap().unwrap().subject, "t.other-put");

        // keep=0 removes the rest; purging an empty subject purges nothing.
        assert_eq!(log.purge_subject("t.k-put", 0).await.unwrap(), 1);
        assert_eq!(log.purge_subject("t.k-put", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_ends_consumers_and_fails_publishes() {
        let server = MemoryLogServer::new();
        let log = open(&server, "t").await;
        log.publish("t.a-put", b"1".to_vec()).await.unwrap();

        let mut consumer = log.consume(Seq::from_raw(1)).await.unwrap();
        consumer.next().await.unwrap().unwrap();

        log.delete_stream().await.unwrap();
        assert!(consumer.next().await.unwrap().is_none());
        assert!(matches!(
            log.publish("t.a-put", b"2".to_vec()).await,
            Err(Error::LogUnavailable(_))
        ));

        // Reopening the name starts a fresh log.
        let fresh = open(&server, "t").await;
        assert_eq!(fresh.last_seq().await.unwrap(), Seq::ZERO);
    }
}
