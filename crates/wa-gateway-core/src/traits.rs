//! Core traits for session storage and chat-network connections.

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{ChatId, MessageContent};

/// Session status as persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// A connection attempt is in progress, no pairing code yet.
    Connecting,
    /// Waiting for the end user to scan the pairing code.
    Qr,
    /// Paired and ready to send.
    Connected,
    /// Connection lost or rejected; eligible for restore.
    Disconnected,
    /// Explicitly signed out. Terminal.
    SignedOut,
}

impl SessionStatus {
    /// Wire/storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Qr => "qr",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::SignedOut => "signed_out",
        }
    }

    /// No automatic transitions leave a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::SignedOut)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connecting" => Ok(Self::Connecting),
            "qr" => Ok(Self::Qr),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "signed_out" => Ok(Self::SignedOut),
            other => Err(StoreError::Internal(format!("unknown session status: {other}"))),
        }
    }
}

/// Persisted session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Unique session name (store key).
    pub session_name: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Raw pairing code, present only while `status == Qr`.
    pub pairing_code: Option<String>,
    /// Last failure reason, if any.
    pub last_error: Option<String>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

impl SessionRecord {
    /// Create a fresh record in the `connecting` state.
    #[must_use]
    pub fn new(session_name: impl Into<String>, now: i64) -> Self {
        Self {
            session_name: session_name.into(),
            status: SessionStatus::Connecting,
            pairing_code: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update. Returns `false` if the update's guard
    /// rejected it and the record was left untouched.
    ///
    /// The pairing code never outlives the `qr` status: it is cleared
    /// whenever the resulting status is anything else.
    pub fn apply(&mut self, update: &SessionUpdate, now: i64) -> bool {
        if update.unless_status == Some(self.status) {
            return false;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(ref code) = update.pairing_code {
            self.pairing_code.clone_from(code);
        }
        if let Some(ref err) = update.last_error {
            self.last_error.clone_from(err);
        }
        if self.status != SessionStatus::Qr {
            self.pairing_code = None;
        }
        self.updated_at = now;
        true
    }
}

/// Partial update of a [`SessionRecord`].
///
/// `None` leaves a field untouched; `Some(None)` clears a nullable field.
/// `unless_status` makes the store skip the update when the record is
/// currently in that status (checked atomically with the write).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub pairing_code: Option<Option<String>>,
    pub last_error: Option<Option<String>>,
    pub unless_status: Option<SessionStatus>,
}

impl SessionUpdate {
    /// Update that only sets the status.
    #[must_use]
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Set the pairing code.
    #[must_use]
    pub fn with_pairing_code(mut self, code: impl Into<String>) -> Self {
        self.pairing_code = Some(Some(code.into()));
        self
    }

    /// Clear the pairing code.
    #[must_use]
    pub fn clear_pairing_code(mut self) -> Self {
        self.pairing_code = Some(None);
        self
    }

    /// Set the last error.
    #[must_use]
    pub fn with_last_error(mut self, reason: impl Into<String>) -> Self {
        self.last_error = Some(Some(reason.into()));
        self
    }

    /// Clear the last error.
    #[must_use]
    pub fn clear_last_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    /// Skip the update if the record is currently `status`.
    #[must_use]
    pub const fn unless(mut self, status: SessionStatus) -> Self {
        self.unless_status = Some(status);
        self
    }
}

/// Session filter for queries.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Only sessions with this status.
    pub status: Option<SessionStatus>,
    /// Skip sessions with this status.
    pub exclude_status: Option<SessionStatus>,
    /// Limit results.
    pub limit: Option<usize>,
}

impl SessionFilter {
    /// Filter matching every non-terminal session.
    #[must_use]
    pub fn restorable() -> Self {
        Self {
            exclude_status: Some(SessionStatus::SignedOut),
            ..Self::default()
        }
    }

    /// Whether a record passes this filter (ignores `limit`).
    #[must_use]
    pub fn matches(&self, record: &SessionRecord) -> bool {
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.exclude_status.is_some_and(|s| s == record.status) {
            return false;
        }
        true
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("storage error: {0}")]
    Internal(String),
}

/// Trait for session storage backends.
///
/// Records are keyed by session name. Implementations run the
/// read-modify-write of `upsert`/`update` atomically per key where the
/// backend allows it.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Get a session by name.
    async fn find_one(&self, session_name: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// List sessions with optional filter.
    async fn find_many(&self, filter: SessionFilter) -> Result<Vec<SessionRecord>, StoreError>;

    /// Apply `update`, creating the record first if it does not exist.
    ///
    /// Returns the stored record, unchanged if the update's guard rejected it.
    async fn upsert(
        &self,
        session_name: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError>;

    /// Apply `update` to an existing record.
    async fn update(
        &self,
        session_name: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError>;
}

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn find_one(&self, session_name: &str) -> Result<Option<SessionRecord>, StoreError> {
        (**self).find_one(session_name).await
    }

    async fn find_many(&self, filter: SessionFilter) -> Result<Vec<SessionRecord>, StoreError> {
        (**self).find_many(filter).await
    }

    async fn upsert(
        &self,
        session_name: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError> {
        (**self).upsert(session_name, update).await
    }

    async fn update(
        &self,
        session_name: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError> {
        (**self).update(session_name, update).await
    }
}

/// Lifecycle event emitted by a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A (new) pairing code is available. May repeat on rotation.
    Paired { code: String },
    /// Authenticated and ready to send.
    Ready,
    /// The network rejected the credentials.
    AuthFailure { reason: String },
    /// The connection was lost.
    Disconnected { reason: String },
}

/// Live state reported by [`Connection::get_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Opening,
    Pairing,
    Unpaired,
    Conflict,
    Timeout,
    Other(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("CONNECTED"),
            Self::Opening => f.write_str("OPENING"),
            Self::Pairing => f.write_str("PAIRING"),
            Self::Unpaired => f.write_str("UNPAIRED"),
            Self::Conflict => f.write_str("CONFLICT"),
            Self::Timeout => f.write_str("TIMEOUT"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// Acknowledgement returned by the network for a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    /// Network-assigned message id.
    pub id: String,
    /// Destination address.
    pub to: String,
    /// Send timestamp (Unix epoch seconds).
    pub timestamp: i64,
}

/// Connection error.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("initialize failed: {0}")]
    Initialize(String),
    #[error("destroy failed: {0}")]
    Destroy(String),
    #[error("state query failed: {0}")]
    State(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection closed")]
    Closed,
    #[error("connection error: {0}")]
    Other(String),
}

/// One live attempt to talk to the chat network for a session.
///
/// Every action may suspend for an arbitrary amount of time.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Start the connection. Events begin to flow while this runs.
    async fn initialize(&self) -> Result<(), ConnectionError>;

    /// Tear the connection down.
    async fn destroy(&self) -> Result<(), ConnectionError>;

    /// Query the live state.
    async fn get_state(&self) -> Result<ConnectionState, ConnectionError>;

    /// Send a message to an already-normalized address.
    async fn send_message(
        &self,
        to: &ChatId,
        content: &MessageContent,
    ) -> Result<SentMessage, ConnectionError>;
}

/// A freshly constructed connection plus its event stream.
pub struct ConnectionHandle {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle").finish_non_exhaustive()
    }
}

/// Builds connections bound to a session's locally stored credentials.
///
/// Construction must be cheap and must not touch the network; all network
/// work happens in [`Connection::initialize`].
pub trait ConnectionFactory: Send + Sync {
    /// Construct a connection for `session_name`.
    ///
    /// # Errors
    /// Returns error if the connection cannot be constructed.
    fn create(&self, session_name: &str) -> Result<ConnectionHandle, ConnectionError>;
}

impl<T: ConnectionFactory + ?Sized> ConnectionFactory for Arc<T> {
    fn create(&self, session_name: &str) -> Result<ConnectionHandle, ConnectionError> {
        (**self).create(session_name)
    }
}
