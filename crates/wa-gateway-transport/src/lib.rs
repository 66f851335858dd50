//! Boundary layer for the chat gateway.
//!
//! Provides:
//! - Wire protocol (response envelope + validated request bodies)
//! - HTTP transport (feature: http)

pub mod protocol;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{ApiError, create_router};
pub use protocol::{ApiResponse, ApiStatus, PairingResponse, SendMessageRequest, SignRequest};
