//! # basedb — a log-projected key–value store
//!
//! Each logical "base" is backed by a durable, ordered event log stream and
//! a local, embedded, queryable store that is a materialized projection of
//! that log. Every process binding to the same stream converges to the same
//! local state by replaying and tailing the same log.
//!
//! Clients see a mapping from string identifiers to JSON documents, with
//! automatic per-key metadata (creation time, last-modification time,
//! revision count), pattern/query-based listing, and push subscriptions
//! over a predicate.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Manager                               │
//! │        (single-flight opens, idle sweep, lifecycle events)       │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ owns
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              Base                                │
//! │      get / put / insert / delete / keys / query / count /        │
//! │            subscribe / close / delete_stream                     │
//! └───────┬──────────────────────────────────────────────┬───────────┘
//!         │ publish event, await seq                     │ read
//!         ▼                                              ▼
//! ┌────────────────┐   consume    ┌───────────┐   ┌──────────────────┐
//! │   Event log    │─────────────►│ Projector │──►│  Local store     │
//! │ (ordered seqs) │              │ (one task)│   │ (db/meta/settings)│
//! └────────────────┘              └─────┬─────┘   └──────────────────┘
//!                                       │ release ≤ seq      │ notify
//!                                       ▼                    ▼
//!                               SequenceBarrier      SubscriptionRegistry
//! ```
//!
//! A write enters [`Base`], is framed as an [`Event`], published to the
//! log, and assigned a sequence. The writer suspends on the
//! [`SequenceBarrier`]. The [`projector`] consumes the same event, applies
//! it to the local store atomically (document, metadata, checkpoint), fans
//! it out to matching subscribers, and releases barrier waiters. The
//! writer wakes, reads the projected record, compacts the key's PUT
//! history down to the latest entry, and returns.
//!
//! ## Core Invariants
//!
//! 1. Projection applies events in strictly increasing sequence order.
//! 2. The persisted checkpoint never leads the projected data; restart
//!    resumes at `checkpoint + 1` and re-application is idempotent.
//! 3. A writer that awaited sequence `s` observes every event ≤ `s`.
//! 4. Per-key compaction keeps at least the latest PUT of every live key.
//! 5. Subscriber callbacks for an event complete before that event's
//!    barrier waiters wake.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use basedb::{Base, BaseConfig, MemoryLogServer};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> basedb::Result<()> {
//!     let server = Arc::new(MemoryLogServer::new());
//!     let base = Base::open(server, BaseConfig::new("users")).await?;
//!
//!     base.put("user1", json!({"name": "John Doe", "age": 30})).await?;
//!     let record = base.get("user1").await?.unwrap();
//!     assert_eq!(record.data["name"], "John Doe");
//!     assert_eq!(record.meta.changes, 1);
//!
//!     base.close().await
//! }
//! ```

pub mod barrier;
pub mod base;
pub mod error;
pub mod log;
pub mod manager;
pub mod predicate;
pub mod projector;
pub mod stats;
pub mod store;
pub mod subject;
pub mod subscription;
pub mod types;

pub use base::{default_db_path, Base, BaseConfig};
pub use error::{Error, Result};
pub use manager::{Manager, ManagerConfig, ManagerEvent};

pub use barrier::SequenceBarrier;
pub use log::{EventLog, LogConsumer, LogEntry, LogServer, MemoryLogServer};
pub use projector::EventHook;
pub use stats::{StatsEvent, StatsOperation};
pub use store::QueryOptions;
pub use subscription::Subscription;
pub use types::{Event, EventKind, MetaData, Record, Seq};
