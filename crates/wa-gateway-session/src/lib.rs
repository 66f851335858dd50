//! Session lifecycle and dispatch for the chat gateway.
//!
//! Provides:
//! - `SessionManager` - pairing, restore, sign-out, send and broadcast
//! - `Registry` - the in-process set of live connections
//! - Storage implementations (memory, SQLite)

pub mod config;
pub mod dispatch;
pub mod error;
mod lifecycle;
pub mod manager;
pub mod pairing;
pub mod registry;
pub mod restore;
pub mod storage;

pub use config::{ManagerConfig, PacingConfig};
pub use dispatch::{BroadcastRequest, BroadcastTicket, Pacing, Recipient, parse_recipients};
pub use error::{ErrorKind, ManagerError};
pub use manager::{SendRequest, SessionManager};
pub use pairing::{PairingArtifact, PairingOutcome};
pub use registry::{Phase, Registry};
pub use restore::RestoreReport;
