//! Scripted connections for tests and local sandboxes.
//!
//! Each connection replays a [`Script`] while it initializes and can be
//! driven further by hand with [`ScriptedConnection::emit`].

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};
use uuid::Uuid;

use crate::{
    message::{ChatId, MessageContent},
    traits::{
        Connection, ConnectionError, ConnectionEvent, ConnectionFactory, ConnectionHandle,
        ConnectionState, SentMessage,
    },
};

/// One step of a connection script.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(ConnectionEvent),
    Wait(Duration),
}

/// Behaviour of a scripted connection.
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<ScriptStep>,
    initialize_error: Option<String>,
    destroy_error: Option<String>,
    failing_recipients: HashSet<String>,
}

impl Script {
    /// Empty script: initializes and emits nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a pairing code.
    #[must_use]
    pub fn pairing(code: impl Into<String>) -> Self {
        Self::new().emit(ConnectionEvent::Paired { code: code.into() })
    }

    /// Come up ready with stored credentials.
    #[must_use]
    pub fn ready() -> Self {
        Self::new().emit(ConnectionEvent::Ready)
    }

    /// Append an event.
    #[must_use]
    pub fn emit(mut self, event: ConnectionEvent) -> Self {
        self.steps.push(ScriptStep::Emit(event));
        self
    }

    /// Append a pause.
    #[must_use]
    pub fn wait(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Wait(duration));
        self
    }

    /// Make `initialize` fail after replaying the steps.
    #[must_use]
    pub fn fail_initialize(mut self, reason: impl Into<String>) -> Self {
        self.initialize_error = Some(reason.into());
        self
    }

    /// Make `destroy` fail.
    #[must_use]
    pub fn fail_destroy(mut self, reason: impl Into<String>) -> Self {
        self.destroy_error = Some(reason.into());
        self
    }

    /// Make sends to `address` fail (normalized form, e.g. `62811@c.us`).
    #[must_use]
    pub fn fail_send_to(mut self, address: impl Into<String>) -> Self {
        self.failing_recipients.insert(address.into());
        self
    }
}

/// A message recorded by a [`ScriptedConnection`].
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub to: ChatId,
    pub content: MessageContent,
    pub at: Instant,
}

/// Connection that follows a [`Script`].
pub struct ScriptedConnection {
    session_name: String,
    script: Script,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Mutex<ConnectionState>,
    destroyed: AtomicBool,
    initialize_calls: AtomicUsize,
    sent: Mutex<Vec<RecordedSend>>,
}

impl ScriptedConnection {
    /// Session this connection belongs to.
    #[must_use]
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Emit an event as if it came from the network.
    pub fn emit(&self, event: ConnectionEvent) {
        let next = match &event {
            ConnectionEvent::Paired { .. } => ConnectionState::Pairing,
            ConnectionEvent::Ready => ConnectionState::Connected,
            ConnectionEvent::AuthFailure { .. } => ConnectionState::Unpaired,
            ConnectionEvent::Disconnected { .. } => ConnectionState::Other("DISCONNECTED".into()),
        };
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
        let _ = self.events.send(event);
    }

    /// Whether `destroy` was called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Number of `initialize` calls.
    #[must_use]
    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    /// Messages delivered so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<RecordedSend> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn initialize(&self) -> Result<(), ConnectionError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Opening;

        for step in &self.script.steps {
            if self.is_destroyed() {
                return Err(ConnectionError::Closed);
            }
            match step {
                ScriptStep::Emit(event) => self.emit(event.clone()),
                ScriptStep::Wait(duration) => tokio::time::sleep(*duration).await,
            }
        }

        match &self.script.initialize_error {
            Some(reason) => Err(ConnectionError::Initialize(reason.clone())),
            None => Ok(()),
        }
    }

    async fn destroy(&self) -> Result<(), ConnectionError> {
        self.destroyed.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) =
            ConnectionState::Other("DESTROYED".into());
        match &self.script.destroy_error {
            Some(reason) => Err(ConnectionError::Destroy(reason.clone())),
            None => Ok(()),
        }
    }

    async fn get_state(&self) -> Result<ConnectionState, ConnectionError> {
        if self.is_destroyed() {
            return Err(ConnectionError::Closed);
        }
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn send_message(
        &self,
        to: &ChatId,
        content: &MessageContent,
    ) -> Result<SentMessage, ConnectionError> {
        if self.is_destroyed() {
            return Err(ConnectionError::Closed);
        }
        if self.script.failing_recipients.contains(to.as_str()) {
            return Err(ConnectionError::Send(format!("{to} rejected the message")));
        }

        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedSend {
                to: to.clone(),
                content: content.clone(),
                at: Instant::now(),
            });

        Ok(SentMessage {
            id: Uuid::new_v4().to_string(),
            to: to.to_string(),
            timestamp: now(),
        })
    }
}

/// Factory handing out [`ScriptedConnection`]s.
#[derive(Default)]
pub struct ScriptedConnector {
    default_script: Script,
    scripts: Mutex<HashMap<String, Script>>,
    created: Mutex<Vec<Arc<ScriptedConnection>>>,
}

impl ScriptedConnector {
    /// Connector whose connections all follow `default_script`.
    #[must_use]
    pub fn new(default_script: Script) -> Self {
        Self {
            default_script,
            ..Self::default()
        }
    }

    /// Override the script for one session.
    pub fn set_script(&self, session_name: impl Into<String>, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_name.into(), script);
    }

    /// All connections created for `session_name`, oldest first.
    #[must_use]
    pub fn connections(&self, session_name: &str) -> Vec<Arc<ScriptedConnection>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.session_name == session_name)
            .cloned()
            .collect()
    }

    /// Most recent connection for `session_name`.
    #[must_use]
    pub fn latest(&self, session_name: &str) -> Option<Arc<ScriptedConnection>> {
        self.connections(session_name).pop()
    }

    /// Total connections created.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ConnectionFactory for ScriptedConnector {
    fn create(&self, session_name: &str) -> Result<ConnectionHandle, ConnectionError> {
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_name)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ScriptedConnection {
            session_name: session_name.to_string(),
            script,
            events: tx,
            state: Mutex::new(ConnectionState::Unpaired),
            destroyed: AtomicBool::new(false),
            initialize_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        });

        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&connection));

        Ok(ConnectionHandle {
            connection,
            events: rx,
        })
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_replays_events_in_order() {
        let connector = ScriptedConnector::new(
            Script::pairing("code-1")
                .emit(ConnectionEvent::Paired {
                    code: "code-2".into(),
                })
                .emit(ConnectionEvent::Ready),
        );
        let mut handle = connector.create("shop").unwrap();
        handle.connection.initialize().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = handle.events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionEvent::Paired {
                    code: "code-1".into()
                },
                ConnectionEvent::Paired {
                    code: "code-2".into()
                },
                ConnectionEvent::Ready,
            ]
        );
        assert_eq!(
            handle.connection.get_state().await.unwrap(),
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_per_session_script_and_send_failure() {
        let connector = ScriptedConnector::new(Script::ready());
        connector.set_script("other", Script::ready().fail_send_to("1@c.us"));

        let handle = connector.create("other").unwrap();
        handle.connection.initialize().await.unwrap();

        let to = ChatId::normalize("1").unwrap();
        let content = MessageContent::Text("hi".into());
        assert!(handle.connection.send_message(&to, &content).await.is_err());

        let to = ChatId::normalize("2").unwrap();
        let sent = handle.connection.send_message(&to, &content).await.unwrap();
        assert_eq!(sent.to, "2@c.us");
        assert!(sent.timestamp > 0);
        assert_eq!(connector.latest("other").unwrap().sent().len(), 1);
    }

    #[tokio::test]
    async fn test_destroyed_connection_rejects_actions() {
        let connector = ScriptedConnector::new(Script::ready());
        let handle = connector.create("shop").unwrap();
        handle.connection.destroy().await.unwrap();

        assert!(matches!(
            handle.connection.get_state().await,
            Err(ConnectionError::Closed)
        ));
        assert!(connector.latest("shop").unwrap().is_destroyed());
    }
}
