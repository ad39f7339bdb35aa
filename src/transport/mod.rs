//! Chat transport collaborator.
//!
//! The gateway owns the actual chat connection; chatrun only needs to
//! send new status messages and edit existing ones. Everything else
//! (inbound commands, button clicks) arrives through the HTTP API.

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Identifier of a delivered message, opaque to chatrun.
pub type MessageId = String;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The gateway asked us to slow down. Retried with backoff.
    #[error("rate limited by gateway")]
    RateLimited,

    /// Any other delivery failure.
    #[error("transport error: {0}")]
    Other(String),
}

/// Outbound message channel to the chat gateway.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a new message, optionally with selectable buttons, returning
    /// the message id for later edits.
    async fn send(
        &self,
        conversation_id: &str,
        text: &str,
        buttons: Option<&[String]>,
    ) -> Result<MessageId, TransportError>;

    /// Replace the text of an existing message.
    async fn edit(&self, message_id: &MessageId, text: &str) -> Result<(), TransportError>;
}
