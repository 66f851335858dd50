//! Gateway server backed by a scripted connector.
//!
//! Run with: cargo run -p gateway-server-demo
//!
//! Every session pairs with a generated code and becomes ready twenty
//! seconds later, which is enough to exercise the whole HTTP surface
//! without a real chat network.
//!
//! ```text
//! curl -X POST localhost:3000/whatsapp/qr-sign-in -H 'content-type: application/json' \
//!     -d '{"sessionName":"shop"}'
//! ```

mod config;

use std::{sync::Arc, time::Duration};

use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use wa_gateway_core::{
    ConnectionEvent, ConnectionFactory, DispatchEvent, SessionStore,
    mock::{Script, ScriptedConnector},
};
use wa_gateway_session::{SessionManager, storage::MemoryStorage};
use wa_gateway_transport::create_router;

use crate::config::GatewayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = GatewayConfig::load()?;
    let storage = open_storage(config.database_url.as_deref()).await?;

    let script = Script::pairing(format!("2@{}", Uuid::new_v4().simple()))
        .wait(Duration::from_secs(20))
        .emit(ConnectionEvent::Ready);
    let connector = Arc::new(ScriptedConnector::new(script));

    let manager = SessionManager::new(storage, connector, config.manager.clone());
    spawn_dispatch_logger(&manager);

    let report = manager.restore().await?;
    tracing::info!(
        restored = report.restored.len(),
        awaiting_pairing = report.awaiting_pairing.len(),
        failed = report.failed.len(),
        "Restore finished"
    );

    let app = create_router(manager.clone());
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!("Server listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}

async fn open_storage(database_url: Option<&str>) -> anyhow::Result<Arc<dyn SessionStore>> {
    match database_url {
        #[cfg(feature = "sqlite")]
        Some(url) => {
            tracing::info!(url, "Using SQLite session storage");
            let storage = wa_gateway_session::storage::SqliteStorage::new(url).await?;
            Ok(Arc::new(storage))
        }
        #[cfg(not(feature = "sqlite"))]
        Some(url) => {
            tracing::warn!(url, "Built without sqlite support, keeping sessions in memory");
            Ok(Arc::new(MemoryStorage::new()))
        }
        None => Ok(Arc::new(MemoryStorage::new())),
    }
}

fn spawn_dispatch_logger<S, F>(manager: &SessionManager<S, F>)
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    let mut rx = manager.dispatch_log().get_receiver();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(DispatchEvent::Finished {
                    broadcast_id,
                    session_name,
                    sent,
                    failed,
                    abandoned,
                }) => {
                    tracing::info!(%broadcast_id, session = %session_name, sent, failed, abandoned, "Broadcast finished");
                }
                Ok(event) => tracing::debug!(?event, "Dispatch"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dispatch logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
