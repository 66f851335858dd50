//! Broadcast + history log of dispatch outcomes.
//!
//! Broadcasts run detached from the request that started them, so their
//! progress is only observable here and in the tracing output.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// Default number of events kept for late subscribers.
const HISTORY_EVENTS: usize = 10_000;

/// Live channel capacity.
const CHANNEL_CAPACITY: usize = 1024;

/// Broadcast identifier.
pub type BroadcastId = Uuid;

/// One observable step of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    Started {
        broadcast_id: BroadcastId,
        session_name: String,
        recipients: usize,
    },
    Sent {
        broadcast_id: BroadcastId,
        session_name: String,
        recipient: String,
        message_id: String,
    },
    Failed {
        broadcast_id: BroadcastId,
        session_name: String,
        recipient: String,
        error: String,
    },
    /// Not attempted because the session's connection went away.
    Abandoned {
        broadcast_id: BroadcastId,
        session_name: String,
        recipient: String,
        reason: String,
    },
    Finished {
        broadcast_id: BroadcastId,
        session_name: String,
        sent: usize,
        failed: usize,
        abandoned: usize,
    },
}

impl DispatchEvent {
    /// Broadcast this event belongs to.
    #[must_use]
    pub const fn broadcast_id(&self) -> BroadcastId {
        match self {
            Self::Started { broadcast_id, .. }
            | Self::Sent { broadcast_id, .. }
            | Self::Failed { broadcast_id, .. }
            | Self::Abandoned { broadcast_id, .. }
            | Self::Finished { broadcast_id, .. } => *broadcast_id,
        }
    }
}

/// Dispatch log with broadcast and history support.
///
/// Subscribers that attach after a broadcast started receive the history
/// first and then switch to live events.
pub struct DispatchLog {
    history: RwLock<VecDeque<DispatchEvent>>,
    capacity: usize,
    sender: broadcast::Sender<DispatchEvent>,
}

impl Default for DispatchLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchLog {
    /// Create a new dispatch log.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_EVENTS)
    }

    /// Create a log that retains at most `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            sender,
        }
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, event: DispatchEvent) {
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
        // Sent under the lock so a subscriber never sees an event twice.
        let _ = self.sender.send(event); // live listeners
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<DispatchEvent> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// History of a single broadcast.
    #[must_use]
    pub fn events_for(&self, broadcast_id: BroadcastId) -> Vec<DispatchEvent> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.broadcast_id() == broadcast_id)
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, DispatchEvent> {
        let (history, rx) = {
            let guard = self.history.read().unwrap_or_else(PoisonError::into_inner);
            (guard.iter().cloned().collect::<Vec<_>>(), self.get_receiver())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| future::ready(res.ok()));

        Box::pin(hist.chain(live))
    }

    /// Stream of one broadcast's events, ending after its `Finished` event.
    #[must_use]
    pub fn broadcast_stream(
        &self,
        broadcast_id: BroadcastId,
    ) -> futures::stream::BoxStream<'static, DispatchEvent> {
        let events = self
            .history_plus_stream()
            .filter(move |e| future::ready(e.broadcast_id() == broadcast_id));

        futures::stream::unfold((events, false), |(mut events, done)| async move {
            if done {
                return None;
            }
            let event = events.next().await?;
            let done = matches!(event, DispatchEvent::Finished { .. });
            Some((event, (events, done)))
        })
        .boxed()
    }
}
