//! Stream connection records and identifiers.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Longest caller-supplied stream identifier accepted by [`StreamId::parse`]
pub const MAX_STREAM_ID_LEN: usize = 128;

/// Reasons a caller-supplied stream identifier is rejected
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidStreamId {
    /// The identifier was empty
    #[error("stream id must not be empty")]
    Empty,

    /// The identifier exceeded [`MAX_STREAM_ID_LEN`]
    #[error("stream id is {len} characters (max: {MAX_STREAM_ID_LEN})")]
    TooLong {
        /// Length of the rejected identifier
        len: usize,
    },

    /// The identifier contained whitespace or a control character
    #[error("stream id contains invalid character {found:?}")]
    InvalidCharacter {
        /// The offending character
        found: char,
    },
}

/// Unique identifier for a client stream
///
/// Generated identifiers have the form `stream-<uuid>`. Identifiers supplied
/// by callers go through [`StreamId::parse`], so a `StreamId` value is always
/// well formed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

impl StreamId {
    /// Generate a fresh random stream ID
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("stream-{}", uuid::Uuid::new_v4()))
    }

    /// Validate a caller-supplied identifier
    ///
    /// # Errors
    ///
    /// Returns [`InvalidStreamId`] if the identifier is empty, longer than
    /// [`MAX_STREAM_ID_LEN`], or contains whitespace/control characters.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidStreamId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidStreamId::Empty);
        }
        let len = raw.chars().count();
        if len > MAX_STREAM_ID_LEN {
            return Err(InvalidStreamId::TooLong { len });
        }
        if let Some(found) = raw.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(InvalidStreamId::InvalidCharacter { found });
        }
        Ok(Self(raw))
    }

    /// Borrow the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StreamId {
    type Error = InvalidStreamId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

/// Open metadata bag attached to a connection
///
/// Values are arbitrary JSON so callers can stash heterogeneous annotations.
pub type Metadata = HashMap<String, serde_json::Value>;

/// State of one active client stream
///
/// Instances live inside the [`ConnectionRegistry`](super::ConnectionRegistry).
/// Every value handed out by the registry is a detached snapshot; changing it
/// has no effect on the registry.
#[derive(Debug, Clone)]
pub struct StreamConnection {
    pub(crate) stream_id: StreamId,
    pub(crate) user_id: String,
    pub(crate) session_id: String,
    pub(crate) connected_at: Instant,
    pub(crate) connected_at_utc: DateTime<Utc>,
    pub(crate) last_ping: Instant,
    pub(crate) tokens_sent: u64,
    pub(crate) reconnect_count: u32,
    pub(crate) partial_response: String,
    pub(crate) metadata: Metadata,
    pub(crate) is_active: bool,
    /// Admission order, breaks ties between equal `connected_at` values
    pub(crate) admission_seq: u64,
}

impl StreamConnection {
    pub(crate) fn new(
        stream_id: StreamId,
        user_id: String,
        session_id: String,
        admission_seq: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            stream_id,
            user_id,
            session_id,
            connected_at: now,
            connected_at_utc: Utc::now(),
            last_ping: now,
            tokens_sent: 0,
            reconnect_count: 0,
            partial_response: String::new(),
            metadata: Metadata::new(),
            is_active: true,
            admission_seq,
        }
    }

    /// The stream identifier
    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// The owning user
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The session this stream belongs to
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Monotonic time the stream was admitted
    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Wall-clock time the stream was admitted
    #[must_use]
    pub fn connected_at_utc(&self) -> DateTime<Utc> {
        self.connected_at_utc
    }

    /// Time of the last heartbeat (or admission, if none yet)
    #[must_use]
    pub fn last_ping(&self) -> Instant {
        self.last_ping
    }

    /// Tokens recorded for this stream
    #[must_use]
    pub fn tokens_sent(&self) -> u64 {
        self.tokens_sent
    }

    /// How many times this stream ID has been reconnected
    #[must_use]
    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count
    }

    /// Text accumulated so far
    #[must_use]
    pub fn partial_response(&self) -> &str {
        &self.partial_response
    }

    /// Metadata annotations
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether the stream is still registered
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Time since the last heartbeat, measured at `now`
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_ping)
    }

    pub(crate) fn apply(&mut self, update: MetricsUpdate) {
        if let Some(tokens) = update.tokens {
            self.tokens_sent = self.tokens_sent.saturating_add(tokens);
        }
        if let Some(delta) = update.partial_response_delta {
            self.partial_response.push_str(&delta);
        }
        if let Some(patch) = update.metadata_patch {
            self.metadata.extend(patch);
        }
    }
}

/// A partial update to a connection's counters, buffer and metadata
///
/// Each field is applied independently: tokens are added, text is appended,
/// metadata entries are merged key by key.
#[derive(Debug, Clone, Default)]
pub struct MetricsUpdate {
    /// Tokens to add to `tokens_sent`
    pub tokens: Option<u64>,
    /// Text to append to the partial response
    pub partial_response_delta: Option<String>,
    /// Entries to merge into the metadata
    pub metadata_patch: Option<Metadata>,
}

impl MetricsUpdate {
    /// Create an empty update
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add tokens
    #[must_use]
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Append text to the partial response
    #[must_use]
    pub fn with_delta(mut self, delta: impl Into<String>) -> Self {
        self.partial_response_delta = Some(delta.into());
        self
    }

    /// Merge one metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata_patch
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value);
        self
    }
}
