//! Core abstractions for the multi-session chat gateway.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionStore` - persisted session records
//! - `Connection` / `ConnectionFactory` - the chat-network seam
//! - `MessageContent` / `ChatId` - validated outbound content
//! - `SettleOnce` - first-settlement-wins result slot
//! - `DispatchLog` - broadcast + history of dispatch outcomes

pub mod dispatch_log;
pub mod message;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod settle;
pub mod traits;

pub use dispatch_log::{BroadcastId, DispatchEvent, DispatchLog};
pub use message::{ChatId, ContentError, MediaPayload, MessageContent};
pub use settle::{SettleOnce, Settled};
pub use traits::{
    Connection, ConnectionError, ConnectionEvent, ConnectionFactory, ConnectionHandle,
    ConnectionState, SentMessage, SessionFilter, SessionRecord, SessionStatus, SessionStore,
    SessionUpdate, StoreError,
};
