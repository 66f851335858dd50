//! Session manager errors.

use std::time::Duration;

use wa_gateway_core::{ConnectionError, ContentError, StoreError};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} already has a connection attempt in progress")]
    AlreadyExists(String),
    #[error("session {0} is already connected")]
    AlreadyConnected(String),
    #[error("session {0} is already signed out")]
    AlreadyTerminal(String),
    #[error("session {session} is not ready (state: {})", .state.as_deref().unwrap_or("none"))]
    NotReady {
        session: String,
        state: Option<String>,
    },
    #[error("{0}")]
    AuthFailure(String),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("{0}")]
    Validation(String),
    #[error("session {session} timed out after {after:?}")]
    Timeout { session: String, after: Duration },
    #[error("failed to render pairing code: {0}")]
    Render(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Coarse classification used by the boundary layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    AlreadyTerminal,
    NotReady,
    AuthFailure,
    Disconnected,
    Validation,
    Timeout,
    DownstreamFailure,
}

impl ManagerError {
    pub(crate) fn not_ready(session: &str, state: Option<String>) -> Self {
        Self::NotReady {
            session: session.to_string(),
            state,
        }
    }

    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Storage(StoreError::NotFound(_)) => ErrorKind::NotFound,
            Self::AlreadyExists(_) | Self::AlreadyConnected(_) => ErrorKind::AlreadyExists,
            Self::AlreadyTerminal(_) => ErrorKind::AlreadyTerminal,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::AuthFailure(_) => ErrorKind::AuthFailure,
            Self::Disconnected(_) => ErrorKind::Disconnected,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Render(_) | Self::Storage(_) | Self::Connection(_) => {
                ErrorKind::DownstreamFailure
            }
        }
    }
}

impl From<ContentError> for ManagerError {
    fn from(e: ContentError) -> Self {
        Self::Validation(e.to_string())
    }
}
