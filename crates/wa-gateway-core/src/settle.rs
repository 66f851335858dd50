//! Settle-once result slot.

use std::sync::Mutex;

use tokio::sync::oneshot;

/// A result slot that can be settled by any of several racing sources.
///
/// The first call to [`settle`](Self::settle) delivers its value; every
/// later call is a no-op that returns `false`.
#[derive(Debug)]
pub struct SettleOnce<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

/// Receiving side of a [`SettleOnce`].
pub type Settled<T> = oneshot::Receiver<T>;

impl<T> SettleOnce<T> {
    /// Create a slot and the receiver that observes its settlement.
    #[must_use]
    pub fn new() -> (Self, Settled<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Settle with `value`. Returns `true` only for the winning call.
    ///
    /// A dropped receiver still consumes the slot.
    pub fn settle(&self, value: T) -> bool {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        match tx {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    /// Whether the slot is already settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_none()
    }
}
