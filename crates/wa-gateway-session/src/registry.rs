//! In-process registry of live connections.
//!
//! The registry holds at most one connection per session name. The lock is
//! only taken for the duration of a single insert/remove/lookup and never
//! across an `.await`, so sessions never wait on each other here.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wa_gateway_core::{Connection, ConnectionError, ConnectionEvent, ConnectionFactory};

/// Identifies one connection attempt, distinct across reconnects.
pub type ConnectionId = u64;

/// What a registered connection is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a pairing handshake to settle.
    Handshaking,
    /// Re-attaching with stored credentials after a restart.
    Restoring,
    /// A pairing code was issued and is waiting to be scanned.
    AwaitingScan,
    /// Ready was observed.
    Live,
}

/// A registered connection.
#[derive(Clone)]
pub struct RegistryEntry {
    pub id: ConnectionId,
    pub connection: Arc<dyn Connection>,
    /// Cancelled when the entry is torn down; in-flight work watches it.
    pub cancel: CancellationToken,
    pub phase: Phase,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Result of a successful [`Registry::register`].
#[derive(Debug)]
pub struct Registration {
    pub entry: RegistryEntry,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Stale entry that was swapped out; the caller tears it down.
    pub replaced: Option<RegistryEntry>,
}

/// Registration error.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("session already has a registered connection")]
    Occupied(RegistryEntry),
    #[error("failed to construct connection: {0}")]
    Connect(#[from] ConnectionError),
}

/// Registry of live connections keyed by session name.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
    next_id: AtomicU64,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the entry for a session.
    #[must_use]
    pub fn get(&self, session_name: &str) -> Option<RegistryEntry> {
        self.lock().get(session_name).cloned()
    }

    /// Construct and register a connection for `session_name`.
    ///
    /// The slot must be empty, or hold exactly the entry named by `replace`.
    /// Construction happens under the lock, so concurrent callers for the
    /// same name never both create a connection.
    ///
    /// # Errors
    /// Returns `Occupied` if another entry holds the slot, or `Connect` if
    /// the factory fails.
    pub fn register<F>(
        &self,
        session_name: &str,
        phase: Phase,
        replace: Option<ConnectionId>,
        factory: &F,
    ) -> Result<Registration, RegisterError>
    where
        F: ConnectionFactory + ?Sized,
    {
        let mut entries = self.lock();

        if let Some(existing) = entries.get(session_name) {
            if replace != Some(existing.id) {
                return Err(RegisterError::Occupied(existing.clone()));
            }
        }

        let handle = factory.create(session_name)?;
        let entry = RegistryEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            connection: handle.connection,
            cancel: CancellationToken::new(),
            phase,
        };
        let replaced = entries.insert(session_name.to_string(), entry.clone());

        Ok(Registration {
            entry,
            events: handle.events,
            replaced,
        })
    }

    /// Update the phase of the entry `id`. Returns `false` if it is gone.
    pub fn set_phase(&self, session_name: &str, id: ConnectionId, phase: Phase) -> bool {
        match self.lock().get_mut(session_name) {
            Some(entry) if entry.id == id => {
                entry.phase = phase;
                true
            }
            _ => false,
        }
    }

    /// Whether `id` is still the registered connection for the session.
    #[must_use]
    pub fn is_current(&self, session_name: &str, id: ConnectionId) -> bool {
        self.lock()
            .get(session_name)
            .is_some_and(|entry| entry.id == id)
    }

    /// Remove the entry only if it is still connection `id`.
    pub fn remove(&self, session_name: &str, id: ConnectionId) -> Option<RegistryEntry> {
        let mut entries = self.lock();
        if entries.get(session_name).is_some_and(|e| e.id == id) {
            entries.remove(session_name)
        } else {
            None
        }
    }

    /// Remove whatever entry the session has.
    pub fn take(&self, session_name: &str) -> Option<RegistryEntry> {
        self.lock().remove(session_name)
    }

    /// Remove every entry.
    pub fn drain(&self) -> Vec<(String, RegistryEntry)> {
        self.lock().drain().collect()
    }

    /// Names of all registered sessions.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
