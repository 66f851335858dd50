//! Startup restore of non-terminal sessions.

use std::sync::Arc;

use serde::Serialize;
use wa_gateway_core::{
    ConnectionFactory, SessionFilter, SessionStatus, SessionStore, SessionUpdate, SettleOnce,
};

use crate::{
    error::ManagerError,
    lifecycle::{HandshakeOutcome, Lifecycle, join_cancelled},
    manager::{SessionManager, destroy_quietly},
    registry::{Phase, RegisterError},
};

/// What happened to each session during [`SessionManager::restore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    /// Reattached with stored credentials.
    pub restored: Vec<String>,
    /// Stored credentials were rejected and a fresh code was issued.
    pub awaiting_pairing: Vec<String>,
    /// Session name and reason.
    pub failed: Vec<(String, String)>,
    /// Already registered in this process.
    pub skipped: Vec<String>,
}

enum RestoreOutcome {
    Restored,
    AwaitingPairing,
    Failed(String),
    Skipped,
}

impl<S, F> SessionManager<S, F>
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    /// Reattach a connection for every persisted session that is not
    /// signed out. Sessions are restored concurrently and independently;
    /// a failure is persisted on that session and never aborts the others.
    ///
    /// # Errors
    /// Returns error only if the store cannot be queried.
    pub async fn restore(&self) -> Result<RestoreReport, ManagerError> {
        let records = self
            .shared
            .storage
            .find_many(SessionFilter::restorable())
            .await?;
        tracing::info!(count = records.len(), "Restoring sessions");

        let outcomes = futures::future::join_all(
            records
                .into_iter()
                .map(|record| async move {
                    let outcome = self.restore_one(&record.session_name).await;
                    (record.session_name, outcome)
                }),
        )
        .await;

        let mut report = RestoreReport::default();
        for (name, outcome) in outcomes {
            match outcome {
                RestoreOutcome::Restored => report.restored.push(name),
                RestoreOutcome::AwaitingPairing => report.awaiting_pairing.push(name),
                RestoreOutcome::Failed(reason) => report.failed.push((name, reason)),
                RestoreOutcome::Skipped => report.skipped.push(name),
            }
        }

        tracing::info!(
            restored = report.restored.len(),
            awaiting_pairing = report.awaiting_pairing.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Restore finished"
        );
        Ok(report)
    }

    async fn restore_one(&self, session_name: &str) -> RestoreOutcome {
        let registration = match self.shared.registry.register(
            session_name,
            Phase::Restoring,
            None,
            &self.shared.connector,
        ) {
            Ok(registration) => registration,
            Err(RegisterError::Occupied(_)) => {
                tracing::debug!(session = %session_name, "Already registered, skipping restore");
                return RestoreOutcome::Skipped;
            }
            Err(RegisterError::Connect(e)) => {
                let reason = e.to_string();
                tracing::warn!(session = %session_name, error = %reason, "Failed to create connection");
                self.persist_failure(session_name, &reason).await;
                return RestoreOutcome::Failed(reason);
            }
        };

        tracing::info!(session = %session_name, "Restoring session");
        let entry = registration.entry;
        let (slot, settled) = SettleOnce::new();
        let lifecycle = Lifecycle::new(
            Arc::clone(&self.shared),
            session_name,
            entry.clone(),
            Some(slot),
        )
        .spawn(registration.events);

        let timeout = self.shared.config.restore_timeout();
        let reason = match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(Ok(HandshakeOutcome::Ready))) => {
                tracing::info!(session = %session_name, "Session restored");
                return RestoreOutcome::Restored;
            }
            Ok(Ok(Ok(HandshakeOutcome::Paired(_)))) => {
                tracing::info!(session = %session_name, "Session needs pairing again");
                return RestoreOutcome::AwaitingPairing;
            }
            // The lifecycle task already persisted the failure.
            Ok(Ok(Err(e))) => {
                tracing::warn!(session = %session_name, error = %e, "Restore failed");
                return RestoreOutcome::Failed(e.to_string());
            }
            Ok(Err(_)) => "connection closed during restore".to_string(),
            Err(_) => "restore timed out".to_string(),
        };

        tracing::warn!(session = %session_name, %reason, "Restore failed");
        self.shared.registry.remove(session_name, entry.id);
        entry.cancel.cancel();
        join_cancelled(session_name, lifecycle).await;
        destroy_quietly(session_name, entry.connection.as_ref()).await;
        self.persist_failure(session_name, &reason).await;
        RestoreOutcome::Failed(reason)
    }

    async fn persist_failure(&self, session_name: &str, reason: &str) {
        if let Err(e) = self
            .shared
            .storage
            .upsert(
                session_name,
                SessionUpdate::status(SessionStatus::Disconnected)
                    .with_last_error(reason)
                    .unless(SessionStatus::SignedOut),
            )
            .await
        {
            tracing::warn!(session = %session_name, error = %e, "Failed to persist restore failure");
        }
    }
}
