//! Pairing handshake.
//!
//! `begin_pairing` creates a connection, waits for the first pairing code
//! (or readiness) under a bounded timeout, and hands back a scannable
//! artifact. Later code rotations are persisted by the lifecycle task but
//! never settle the handshake a second time.

use std::sync::Arc;

use base64::Engine as _;
use serde::Serialize;
use tokio::task::JoinHandle;
use wa_gateway_core::{
    ConnectionFactory, ConnectionState, SessionStatus, SessionStore, SessionUpdate, SettleOnce,
};

use crate::{
    error::ManagerError,
    lifecycle::{HandshakeOutcome, Lifecycle, join_cancelled},
    manager::{SessionManager, destroy_quietly},
    registry::{Phase, RegisterError, RegistryEntry},
};

/// Side length of the rendered QR image, in pixels.
const QR_MIN_DIMENSION: u32 = 256;

/// A scannable pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingArtifact {
    /// Raw code as emitted by the connection.
    pub code: String,
    /// `data:image/svg+xml;base64,...` QR rendering of `code`.
    pub image: String,
}

impl PairingArtifact {
    /// Render `code` as an SVG QR image data URL.
    ///
    /// # Errors
    /// Returns `Render` if the code cannot be encoded.
    pub fn render(code: &str) -> Result<Self, ManagerError> {
        let qr = qrcode::QrCode::new(code.as_bytes())
            .map_err(|e| ManagerError::Render(e.to_string()))?;
        let svg = qr
            .render::<qrcode::render::svg::Color<'_>>()
            .min_dimensions(QR_MIN_DIMENSION, QR_MIN_DIMENSION)
            .build();
        let encoded = base64::engine::general_purpose::STANDARD.encode(svg.as_bytes());

        Ok(Self {
            code: code.to_string(),
            image: format!("data:image/svg+xml;base64,{encoded}"),
        })
    }
}

/// Result of [`SessionManager::begin_pairing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// Scan this to authorize the session.
    Pairing(PairingArtifact),
    /// The session is (or just became) connected; nothing to scan.
    AlreadyConnected,
}

impl<S, F> SessionManager<S, F>
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    /// Start a pairing handshake for `session_name`.
    ///
    /// Idempotent for sessions that are already connected or already
    /// showing a code: no second connection is created.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if a handshake or restore is already in
    /// flight, `AuthFailure`/`Disconnected` if the connection fails before
    /// settling, `Timeout` if nothing settles within the configured bound,
    /// and `Render` if the code cannot be turned into an image.
    pub async fn begin_pairing(&self, session_name: &str) -> Result<PairingOutcome, ManagerError> {
        let session_name = session_name.trim();
        if session_name.is_empty() {
            return Err(ManagerError::Validation("sessionName is required".to_string()));
        }

        let mut stale = None;
        if let Some(existing) = self.shared.registry.get(session_name) {
            if existing.connection.get_state().await.ok() == Some(ConnectionState::Connected) {
                tracing::debug!(session = %session_name, "Session already connected");
                return Ok(PairingOutcome::AlreadyConnected);
            }
            match existing.phase {
                Phase::Handshaking | Phase::Restoring => {
                    return Err(ManagerError::AlreadyExists(session_name.to_string()));
                }
                Phase::AwaitingScan => {
                    if let Some(artifact) = self.current_artifact(session_name).await? {
                        return Ok(PairingOutcome::Pairing(artifact));
                    }
                }
                Phase::Live => {}
            }
            stale = Some(existing.id);
        }

        let registration = match self.shared.registry.register(
            session_name,
            Phase::Handshaking,
            stale,
            &self.shared.connector,
        ) {
            Ok(registration) => registration,
            Err(RegisterError::Occupied(_)) => {
                return Err(ManagerError::AlreadyExists(session_name.to_string()));
            }
            Err(RegisterError::Connect(e)) => return Err(e.into()),
        };

        if let Some(replaced) = registration.replaced {
            tracing::info!(session = %session_name, "Replacing stale connection");
            replaced.cancel.cancel();
            destroy_quietly(session_name, replaced.connection.as_ref()).await;
        }

        let entry = registration.entry;
        if let Err(e) = self
            .shared
            .storage
            .upsert(
                session_name,
                SessionUpdate::status(SessionStatus::Connecting).clear_last_error(),
            )
            .await
        {
            self.abandon(session_name, &entry).await;
            return Err(e.into());
        }

        tracing::info!(session = %session_name, "Pairing handshake started");
        let (slot, settled) = SettleOnce::new();
        let lifecycle = Lifecycle::new(
            Arc::clone(&self.shared),
            session_name,
            entry.clone(),
            Some(slot),
        )
        .spawn(registration.events);

        let timeout = self.shared.config.handshake_timeout();
        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(Ok(HandshakeOutcome::Paired(code)))) => match PairingArtifact::render(&code) {
                Ok(artifact) => Ok(PairingOutcome::Pairing(artifact)),
                Err(e) => {
                    self.fail_handshake(session_name, &entry, lifecycle, e.to_string())
                        .await;
                    Err(e)
                }
            },
            Ok(Ok(Ok(HandshakeOutcome::Ready))) => Ok(PairingOutcome::AlreadyConnected),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => {
                let reason = "connection closed before pairing".to_string();
                self.fail_handshake(session_name, &entry, lifecycle, reason.clone())
                    .await;
                Err(ManagerError::not_ready(session_name, Some(reason)))
            }
            Err(_) => {
                tracing::warn!(session = %session_name, ?timeout, "Pairing handshake timed out");
                self.fail_handshake(
                    session_name,
                    &entry,
                    lifecycle,
                    "pairing timed out".to_string(),
                )
                .await;
                Err(ManagerError::Timeout {
                    session: session_name.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Current pairing artifact of a session waiting to be scanned.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown sessions, `AlreadyConnected` for
    /// connected ones, `AlreadyTerminal` for signed-out ones and `NotReady`
    /// when no code is available.
    pub async fn pairing_artifact(&self, session_name: &str) -> Result<PairingArtifact, ManagerError> {
        let session_name = session_name.trim();
        let record = self.get_session(session_name).await?;
        match (record.status, record.pairing_code) {
            (SessionStatus::Qr, Some(code)) => PairingArtifact::render(&code),
            (SessionStatus::Connected, _) => {
                Err(ManagerError::AlreadyConnected(session_name.to_string()))
            }
            (SessionStatus::SignedOut, _) => {
                Err(ManagerError::AlreadyTerminal(session_name.to_string()))
            }
            (status, _) => Err(ManagerError::not_ready(
                session_name,
                Some(status.as_str().to_string()),
            )),
        }
    }

    /// Artifact for the persisted code, if the session is showing one.
    async fn current_artifact(
        &self,
        session_name: &str,
    ) -> Result<Option<PairingArtifact>, ManagerError> {
        let record = self.shared.storage.find_one(session_name).await?;
        match record {
            Some(record) if record.status == SessionStatus::Qr => record
                .pairing_code
                .as_deref()
                .map(PairingArtifact::render)
                .transpose(),
            _ => Ok(None),
        }
    }

    /// Tear down a handshake that will not complete and record why.
    ///
    /// The lifecycle task is joined before the failure is written so a
    /// transition it was still persisting cannot overwrite it.
    async fn fail_handshake(
        &self,
        session_name: &str,
        entry: &RegistryEntry,
        lifecycle: JoinHandle<()>,
        reason: String,
    ) {
        self.shared.registry.remove(session_name, entry.id);
        entry.cancel.cancel();
        join_cancelled(session_name, lifecycle).await;
        destroy_quietly(session_name, entry.connection.as_ref()).await;
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
            tracing::warn!(session = %session_name, error = %e, "Failed to persist handshake failure");
        }
    }

    /// Drop `entry` from the registry (if still current) and destroy it.
    async fn abandon(&self, session_name: &str, entry: &RegistryEntry) {
        self.shared.registry.remove(session_name, entry.id);
        entry.cancel.cancel();
        destroy_quietly(session_name, entry.connection.as_ref()).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wa_gateway_core::{
        ConnectionEvent,
        mock::{Script, ScriptedConnector},
    };

    use super::*;
    use crate::{
        config::ManagerConfig,
        storage::{MemoryStorage, testing::SlowQrStorage},
    };

    type TestManager = SessionManager<Arc<MemoryStorage>, Arc<ScriptedConnector>>;

    fn setup(script: Script, config: ManagerConfig) -> (TestManager, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new(script));
        let manager =
            SessionManager::new(Arc::new(MemoryStorage::new()), Arc::clone(&connector), config);
        (manager, connector)
    }

    #[test]
    fn test_render_produces_svg_data_url() {
        let artifact = PairingArtifact::render("2@abc,def,ghi").unwrap();
        assert_eq!(artifact.code, "2@abc,def,ghi");
        let encoded = artifact
            .image
            .strip_prefix("data:image/svg+xml;base64,")
            .unwrap();
        let svg = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert!(String::from_utf8(svg).unwrap().contains("<svg"));
    }

    #[tokio::test]
    async fn test_first_code_resolves_handshake() {
        let (manager, _) = setup(Script::pairing("2@first"), ManagerConfig::default());

        let outcome = manager.begin_pairing("shop").await.unwrap();
        let PairingOutcome::Pairing(artifact) = outcome else {
            panic!("expected a pairing artifact");
        };
        assert_eq!(artifact.code, "2@first");

        let record = manager.get_session("shop").await.unwrap();
        assert_eq!(record.status, SessionStatus::Qr);
        assert_eq!(record.pairing_code.as_deref(), Some("2@first"));
        assert_eq!(manager.registry().len(), 1);

        let lookup = manager.pairing_artifact("shop").await.unwrap();
        assert_eq!(lookup, artifact);
    }

    #[tokio::test]
    async fn test_ready_without_code_is_already_connected() {
        let (manager, connector) = setup(Script::ready(), ManagerConfig::default());

        let outcome = manager.begin_pairing("shop").await.unwrap();
        assert_eq!(outcome, PairingOutcome::AlreadyConnected);

        let record = manager.get_session("shop").await.unwrap();
        assert_eq!(record.status, SessionStatus::Connected);
        assert!(record.pairing_code.is_none());

        // Second call reuses the registered connection.
        let outcome = manager.begin_pairing("shop").await.unwrap();
        assert_eq!(outcome, PairingOutcome::AlreadyConnected);
        assert_eq!(connector.created_count(), 1);

        let err = manager.pairing_artifact("shop").await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyConnected(_)));
    }

    #[tokio::test]
    async fn test_disconnect_before_code_fails_handshake() {
        let (manager, connector) = setup(
            Script::new().emit(ConnectionEvent::Disconnected {
                reason: "NAVIGATION".into(),
            }),
            ManagerConfig::default(),
        );

        let err = manager.begin_pairing("shop").await.unwrap_err();
        assert!(matches!(err, ManagerError::Disconnected(_)));
        assert!(manager.registry().is_empty());
        assert!(connector.latest("shop").unwrap().is_destroyed());

        let record = manager.get_session("shop").await.unwrap();
        assert_eq!(record.status, SessionStatus::Disconnected);
        assert_eq!(record.last_error.as_deref(), Some("NAVIGATION"));

        let err = manager.pairing_artifact("shop").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotReady { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_times_out() {
        let config = ManagerConfig {
            handshake_timeout_secs: 5,
            ..ManagerConfig::default()
        };
        let (manager, connector) = setup(
            Script::new()
                .wait(Duration::from_secs(60))
                .emit(ConnectionEvent::Paired {
                    code: "too-late".into(),
                }),
            config,
        );

        let err = manager.begin_pairing("shop").await.unwrap_err();
        assert!(matches!(err, ManagerError::Timeout { after, .. } if after == Duration::from_secs(5)));
        assert!(manager.registry().is_empty());
        assert!(connector.latest("shop").unwrap().is_destroyed());

        let record = manager.get_session("shop").await.unwrap();
        assert_eq!(record.status, SessionStatus::Disconnected);
        assert_eq!(record.last_error.as_deref(), Some("pairing timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_outlasts_in_flight_code_write() {
        let config = ManagerConfig {
            handshake_timeout_secs: 5,
            ..ManagerConfig::default()
        };
        let connector = Arc::new(ScriptedConnector::new(
            Script::new()
                .wait(Duration::from_millis(4500))
                .emit(ConnectionEvent::Paired {
                    code: "late".into(),
                }),
        ));
        let manager = SessionManager::new(
            Arc::new(SlowQrStorage::new(Duration::from_secs(1))),
            Arc::clone(&connector),
            config,
        );

        let err = manager.begin_pairing("shop").await.unwrap_err();
        assert!(matches!(err, ManagerError::Timeout { .. }));
        assert!(manager.registry().is_empty());
        assert!(connector.latest("shop").unwrap().is_destroyed());

        let record = manager.get_session("shop").await.unwrap();
        assert_eq!(record.status, SessionStatus::Disconnected);
        assert!(record.pairing_code.is_none());
        assert_eq!(record.last_error.as_deref(), Some("pairing timed out"));

        let err = manager.pairing_artifact("shop").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotReady { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_during_handshake_ends_it() {
        let (manager, connector) = setup(
            Script::new()
                .wait(Duration::from_secs(60))
                .emit(ConnectionEvent::Paired {
                    code: "2@never".into(),
                }),
            ManagerConfig::default(),
        );

        let pairing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.begin_pairing("shop").await }
        });
        while manager.get_session("shop").await.is_err() {
            tokio::task::yield_now().await;
        }

        manager.sign_out("shop").await.unwrap();

        let err = pairing.await.unwrap().unwrap_err();
        assert!(matches!(err, ManagerError::NotReady { .. }));
        assert!(manager.registry().is_empty());
        assert!(connector.latest("shop").unwrap().is_destroyed());

        let record = manager.get_session("shop").await.unwrap();
        assert_eq!(record.status, SessionStatus::SignedOut);
    }

    #[tokio::test]
    async fn test_concurrent_pairing_creates_one_connection() {
        let (manager, connector) = setup(Script::pairing("2@shared"), ManagerConfig::default());

        let (a, b) = tokio::join!(manager.begin_pairing("shop"), manager.begin_pairing("shop"));

        assert_eq!(connector.created_count(), 1);
        for result in [a, b] {
            match result {
                Ok(PairingOutcome::Pairing(artifact)) => assert_eq!(artifact.code, "2@shared"),
                Err(ManagerError::AlreadyExists(name)) => assert_eq!(name, "shop"),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_pairing_after_sign_out_starts_fresh() {
        let (manager, connector) = setup(Script::ready(), ManagerConfig::default());
        manager.begin_pairing("shop").await.unwrap();
        manager.sign_out("shop").await.unwrap();

        connector.set_script("shop", Script::pairing("2@again"));
        let outcome = manager.begin_pairing("shop").await.unwrap();
        assert!(matches!(outcome, PairingOutcome::Pairing(_)));
        assert_eq!(connector.created_count(), 2);

        let record = manager.get_session("shop").await.unwrap();
        assert_eq!(record.status, SessionStatus::Qr);
    }

    #[tokio::test]
    async fn test_repeat_pairing_returns_current_code() {
        let (manager, connector) = setup(Script::pairing("2@first"), ManagerConfig::default());

        let first = manager.begin_pairing("shop").await.unwrap();
        let second = manager.begin_pairing("shop").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(connector.created_count(), 1);
    }

    #[tokio::test]
    async fn test_padded_names_resolve_to_one_session() {
        let (manager, connector) = setup(Script::pairing("2@pad"), ManagerConfig::default());

        manager.begin_pairing(" shop ").await.unwrap();
        assert_eq!(manager.get_session("shop").await.unwrap().session_name, "shop");
        assert_eq!(manager.pairing_artifact(" shop").await.unwrap().code, "2@pad");

        let record = manager.sign_out("shop\t").await.unwrap();
        assert_eq!(record.status, SessionStatus::SignedOut);
        assert!(manager.registry().is_empty());
        assert_eq!(connector.created_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() {
        let (manager, connector) = setup(Script::ready(), ManagerConfig::default());
        let err = manager.begin_pairing("  ").await.unwrap_err();
        assert!(matches!(err, ManagerError::Validation(_)));
        assert_eq!(connector.created_count(), 0);
    }
}
