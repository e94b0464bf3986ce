//! # Error Handling
//!
//! A single error enum covers every failure mode in the crate. Callers
//! typically either propagate or match on a small number of variants
//! (`InstanceClosed` for lifecycle races, `LogUnavailable` for transport
//! trouble), so one enum keeps signatures simple.
//!
//! Propagation policy:
//!
//! | Path | Policy |
//! |------|--------|
//! | Mutations (`put`/`delete`/`delete_stream`) | fail fast, surfaced to the caller |
//! | Reads | store "not found" is `Ok(None)`, real store failures surface |
//! | Stats publishing | logged and swallowed, never surfaced |
//! | Projection loop | faults the base; later operations see `InstanceClosed` |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in basedb operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation attempted after `close` (or after the projector faulted).
    #[error("instance closed")]
    InstanceClosed,

    /// Publish, consume, or admin call against the log failed.
    ///
    /// Not retried internally; callers construct a new base if the log
    /// session is lost beyond the client's own recovery.
    #[error("log unavailable: {0}")]
    LogUnavailable(String),

    /// After awaiting a sequence, the expected key was absent locally.
    ///
    /// A write that was durably published and projected must be readable;
    /// this variant indicates a faulted projector, not a caller mistake.
    #[error("projection missing for key '{id}'")]
    ProjectionMissing {
        /// The key that should have been projected.
        id: String,
    },

    /// Underlying local store operation failed.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Filesystem operation on the local data directory failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Event or document (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Unknown operator or malformed condition in a predicate or pattern.
    #[error("bad predicate: {0}")]
    BadPredicate(String),

    /// A subject token could not be decoded back into a key.
    #[error("subject codec: {0}")]
    Subject(String),

    /// A managed stream failed to open.
    #[error("stream open failed: {0}")]
    OpenFailed(String),

    /// Task orchestration failure (join errors and the like).
    #[error("internal: {0}")]
    Internal(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
