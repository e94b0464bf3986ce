//! # Subject Codec
//!
//! Canonical mapping between user keys (arbitrary UTF-8) and log subject
//! tokens. Keys may contain `.`, `*`, `>`, whitespace — anything — so they
//! are carried as standard padded base64, which never produces a subject
//! delimiter.
//!
//! Layout for stream `S` and key `K`:
//!
//! ```text
//! S.<base64(K)>-put       PUT events for K
//! S.<base64(K)>-delete    DELETE events for K
//! S.*                     the stream's subject filter
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};
use crate::types::EventKind;

/// Encodes a key into a subject-safe token.
pub fn encode_key(key: &str) -> String {
    STANDARD.encode(key.as_bytes())
}

/// Decodes a subject token back into the original key.
pub fn decode_key(token: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(token)
        .map_err(|e| Error::Subject(format!("invalid token '{token}': {e}")))?;
    String::from_utf8(bytes).map_err(|e| Error::Subject(format!("non-utf8 key: {e}")))
}

/// The subject carrying PUT events for `key` on `stream`.
pub fn put_subject(stream: &str, key: &str) -> String {
    format!("{stream}.{}-put", encode_key(key))
}

/// The subject carrying DELETE events for `key` on `stream`.
pub fn delete_subject(stream: &str, key: &str) -> String {
    format!("{stream}.{}-delete", encode_key(key))
}

/// The subject filter matching every event of `stream`.
pub fn stream_filter(stream: &str) -> String {
    format!("{stream}.*")
}

/// Inverse of the subject builders: recovers `(key, kind)` from a subject.
pub fn parse_subject(stream: &str, subject: &str) -> Result<(String, EventKind)> {
    let token = subject
        .strip_prefix(stream)
        .and_then(|rest| rest.strip_prefix('.'))
        .ok_or_else(|| Error::Subject(format!("subject '{subject}' not on stream '{stream}'")))?;

    if let Some(token) = token.strip_suffix("-put") {
        Ok((decode_key(token)?, EventKind::Put))
    } else if let Some(token) = token.strip_suffix("-delete") {
        Ok((decode_key(token)?, EventKind::Delete))
    } else {
        Err(Error::Subject(format!("unknown suffix in '{subject}'")))
    }
}
