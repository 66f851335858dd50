//! Session manager for orchestrating gateway sessions.

use std::sync::Arc;

use wa_gateway_core::{
    ChatId, Connection, ConnectionFactory, ConnectionState, DispatchLog, MessageContent,
    SentMessage, SessionFilter, SessionRecord, SessionStatus, SessionStore, SessionUpdate,
};

use crate::{config::ManagerConfig, error::ManagerError, registry::Registry};

/// State shared between the manager and the tasks it spawns.
pub(crate) struct Shared<S, F> {
    pub(crate) storage: S,
    pub(crate) connector: F,
    pub(crate) registry: Registry,
    pub(crate) config: ManagerConfig,
    pub(crate) dispatch_log: DispatchLog,
}

/// A single-message send request.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub session_name: String,
    /// Bare number or qualified address.
    pub to: String,
    pub content: MessageContent,
}

/// Session manager for orchestrating gateway sessions.
///
/// Cheap to clone; all clones share one registry. Session names are
/// trimmed by every operation, so `" shop"` and `"shop"` are one session.
pub struct SessionManager<S, F>
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    pub(crate) shared: Arc<Shared<S, F>>,
}

impl<S, F> Clone for SessionManager<S, F>
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, F> SessionManager<S, F>
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    /// Create a new session manager.
    #[must_use]
    pub fn new(storage: S, connector: F, config: ManagerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                storage,
                connector,
                registry: Registry::new(),
                config,
                dispatch_log: DispatchLog::new(),
            }),
        }
    }

    /// Live connections in this process.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Outcomes of detached broadcasts.
    #[must_use]
    pub fn dispatch_log(&self) -> &DispatchLog {
        &self.shared.dispatch_log
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Get a persisted session.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown sessions.
    pub async fn get_session(&self, session_name: &str) -> Result<SessionRecord, ManagerError> {
        let session_name = session_name.trim();
        self.shared
            .storage
            .find_one(session_name)
            .await?
            .ok_or_else(|| ManagerError::NotFound(session_name.to_string()))
    }

    /// List all persisted sessions.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>, ManagerError> {
        Ok(self.shared.storage.find_many(SessionFilter::default()).await?)
    }

    /// Sign a session out: tear down its connection and mark it terminal.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown sessions and `AlreadyTerminal` if the
    /// session is already signed out.
    pub async fn sign_out(&self, session_name: &str) -> Result<SessionRecord, ManagerError> {
        let session_name = session_name.trim();
        let record = self.get_session(session_name).await?;
        if record.status.is_terminal() {
            return Err(ManagerError::AlreadyTerminal(session_name.to_string()));
        }

        if let Some(entry) = self.shared.registry.take(session_name) {
            entry.cancel.cancel();
            destroy_quietly(session_name, entry.connection.as_ref()).await;
        }

        let record = self
            .shared
            .storage
            .update(
                session_name,
                SessionUpdate::status(SessionStatus::SignedOut)
                    .clear_pairing_code()
                    .clear_last_error(),
            )
            .await?;

        tracing::info!(session = %session_name, "Session signed out");
        Ok(record)
    }

    /// Send one message through the session's live connection.
    ///
    /// # Errors
    /// Returns `NotReady` unless the session has a registered connection
    /// that reports itself connected, `Validation` for a malformed target,
    /// and passes the connection's own failure through otherwise.
    pub async fn send(&self, request: SendRequest) -> Result<SentMessage, ManagerError> {
        let SendRequest {
            session_name,
            to,
            content,
        } = request;
        let session_name = session_name.trim();

        let entry = self
            .shared
            .registry
            .get(session_name)
            .ok_or_else(|| ManagerError::not_ready(session_name, None))?;

        let to = ChatId::normalize(&to)?;
        send_via(session_name, entry.connection.as_ref(), &to, &content).await
    }

    /// Destroy every registered connection.
    ///
    /// Persisted statuses are left alone so a restart restores them.
    pub async fn shutdown(&self) {
        let entries = self.shared.registry.drain();
        tracing::info!(count = entries.len(), "Destroying connections");

        let destroys = entries.into_iter().map(|(name, entry)| async move {
            entry.cancel.cancel();
            destroy_quietly(&name, entry.connection.as_ref()).await;
        });
        futures::future::join_all(destroys).await;
    }
}

/// Send through `connection` after checking it reports `Connected`.
pub(crate) async fn send_via(
    session_name: &str,
    connection: &dyn Connection,
    to: &ChatId,
    content: &MessageContent,
) -> Result<SentMessage, ManagerError> {
    let state = connection.get_state().await.ok();
    if state != Some(ConnectionState::Connected) {
        return Err(ManagerError::not_ready(
            session_name,
            state.map(|s| s.to_string()),
        ));
    }
    Ok(connection.send_message(to, content).await?)
}

/// Destroy a connection, logging instead of propagating failure.
pub(crate) async fn destroy_quietly(session_name: &str, connection: &dyn Connection) {
    if let Err(e) = connection.destroy().await {
        tracing::warn!(session = %session_name, error = %e, "Error destroying connection");
    }
}
