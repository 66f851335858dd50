//! Per-connection lifecycle dispatcher.
//!
//! Every connection gets exactly one task that drives `initialize` and
//! consumes the connection's events in arrival order. All persistence and
//! registry side effects of a transition happen here.

use std::{ops::ControlFlow, sync::Arc};

use tokio::{sync::mpsc, task::JoinHandle};
use wa_gateway_core::{
    ConnectionError, ConnectionEvent, ConnectionFactory, SessionStatus, SessionStore,
    SessionUpdate, SettleOnce,
};

use crate::{
    error::ManagerError,
    manager::{Shared, destroy_quietly},
    registry::{Phase, RegistryEntry},
};

/// How a handshake (or restore) settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandshakeOutcome {
    /// First pairing code, raw.
    Paired(String),
    /// Ready before any pairing code: stored credentials were accepted.
    Ready,
}

pub(crate) type HandshakeResult = Result<HandshakeOutcome, ManagerError>;

pub(crate) struct Lifecycle<S, F>
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    shared: Arc<Shared<S, F>>,
    session_name: String,
    entry: RegistryEntry,
    handshake: Option<SettleOnce<HandshakeResult>>,
}

impl<S, F> Lifecycle<S, F>
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    pub(crate) fn new(
        shared: Arc<Shared<S, F>>,
        session_name: &str,
        entry: RegistryEntry,
        handshake: Option<SettleOnce<HandshakeResult>>,
    ) -> Self {
        Self {
            shared,
            session_name: session_name.to_string(),
            entry,
            handshake,
        }
    }

    /// Run the dispatcher as a detached task.
    pub(crate) fn spawn(self, events: mpsc::UnboundedReceiver<ConnectionEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let connection = Arc::clone(&self.entry.connection);
        let cancel = self.entry.cancel.clone();
        let init = connection.initialize();
        tokio::pin!(init);

        let mut initializing = true;
        let mut events_open = true;

        while initializing || events_open {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::debug!(session = %self.session_name, "Lifecycle cancelled");
                    self.settle(Err(ManagerError::not_ready(
                        &self.session_name,
                        Some("torn down".to_string()),
                    )));
                    return;
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        if self.on_event(event).await.is_break() {
                            return;
                        }
                    }
                    None => events_open = false,
                },
                result = &mut init, if initializing => {
                    initializing = false;
                    if let Err(e) = result {
                        self.on_initialize_failed(e).await;
                        return;
                    }
                    tracing::debug!(session = %self.session_name, "Connection initialized");
                }
            }
        }

        tracing::debug!(session = %self.session_name, "Connection event stream ended");
    }

    async fn on_event(&mut self, event: ConnectionEvent) -> ControlFlow<()> {
        let name = self.session_name.clone();
        if !self.shared.registry.is_current(&name, self.entry.id) {
            tracing::debug!(session = %name, ?event, "Ignoring event from replaced connection");
            return ControlFlow::Break(());
        }

        match event {
            ConnectionEvent::Paired { code } => {
                let rotated = self.handshake.as_ref().is_none_or(SettleOnce::is_settled);
                if rotated {
                    tracing::debug!(session = %name, "Pairing code rotated");
                } else {
                    tracing::info!(session = %name, "Pairing code issued");
                }
                self.persist(
                    SessionUpdate::status(SessionStatus::Qr)
                        .with_pairing_code(code.clone())
                        .unless(SessionStatus::SignedOut),
                )
                .await;
                self.shared
                    .registry
                    .set_phase(&name, self.entry.id, Phase::AwaitingScan);
                self.settle(Ok(HandshakeOutcome::Paired(code)));
                ControlFlow::Continue(())
            }
            ConnectionEvent::Ready => {
                tracing::info!(session = %name, "Connection ready");
                self.persist(
                    SessionUpdate::status(SessionStatus::Connected)
                        .clear_pairing_code()
                        .clear_last_error()
                        .unless(SessionStatus::SignedOut),
                )
                .await;
                self.shared
                    .registry
                    .set_phase(&name, self.entry.id, Phase::Live);
                self.settle(Ok(HandshakeOutcome::Ready));
                ControlFlow::Continue(())
            }
            ConnectionEvent::AuthFailure { reason } => {
                let reason = format!("auth_failure: {reason}");
                tracing::warn!(session = %name, %reason, "Authentication failed");
                self.fail(reason.clone(), ManagerError::AuthFailure(reason))
                    .await;
                ControlFlow::Break(())
            }
            ConnectionEvent::Disconnected { reason } => {
                tracing::warn!(session = %name, %reason, "Connection disconnected");
                self.fail(reason.clone(), ManagerError::Disconnected(reason))
                    .await;
                ControlFlow::Break(())
            }
        }
    }

    async fn on_initialize_failed(&mut self, error: ConnectionError) {
        tracing::warn!(session = %self.session_name, %error, "Connection failed to initialize");
        self.fail(error.to_string(), ManagerError::Connection(error))
            .await;
    }

    /// Move to `disconnected`: persist the reason, drop the registry entry,
    /// destroy the connection and fail any pending handshake.
    async fn fail(&mut self, reason: String, error: ManagerError) {
        self.persist(
            SessionUpdate::status(SessionStatus::Disconnected)
                .with_last_error(reason)
                .unless(SessionStatus::SignedOut),
        )
        .await;

        if let Some(entry) = self
            .shared
            .registry
            .remove(&self.session_name, self.entry.id)
        {
            entry.cancel.cancel();
        }
        destroy_quietly(&self.session_name, self.entry.connection.as_ref()).await;

        self.settle(Err(error));
    }

    async fn persist(&self, update: SessionUpdate) {
        if let Err(e) = self
            .shared
            .storage
            .upsert(&self.session_name, update)
            .await
        {
            tracing::warn!(session = %self.session_name, error = %e, "Failed to persist session status");
        }
    }

    fn settle(&self, result: HandshakeResult) {
        if let Some(slot) = &self.handshake {
            slot.settle(result);
        }
    }
}

/// Wait for a cancelled lifecycle task to exit.
///
/// A transition the task already started persisting lands before this
/// returns, so the caller's own write is the last one.
pub(crate) async fn join_cancelled(session_name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        tracing::warn!(session = %session_name, error = %e, "Lifecycle task panicked");
    }
}
