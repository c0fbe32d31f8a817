//! Client error types.

use crate::discovery::DiscoveryError;

/// Errors surfaced through result handles, event streams, and the `Stopped`
/// event.
///
/// Cloneable so a single failure can fan out to every outstanding waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The engine shut down while the conversation was outstanding.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connect to {address}:{port} failed: {message}")]
    Connect {
        address: String,
        port: u16,
        message: String,
    },
    /// Socket-level failure; demoted to a reconnect, never shown to callers.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Malformed frame or undecodable body.
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("server rejected the request: {message}")]
    BadRequest { message: String },
    #[error("server did not handle the request: {reason}")]
    NotHandled { reason: String },
    #[error("credentials were not accepted")]
    NotAuthenticated,
    #[error("operation failed: {message}")]
    OperationFailed { message: String },
    #[error("subscription dropped: {reason}")]
    SubscriptionDropped { reason: String },
    #[error("unexpected command 0x{actual:02x} while waiting for {expected}")]
    UnexpectedCommand { expected: &'static str, actual: u8 },
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}
