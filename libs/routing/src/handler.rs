//! Message Handler Contract
//!
//! Every command module registers through this trait; the registry stores
//! trait references only, so the routing core never sees a concrete handler
//! type and carries no environment coupling.

use async_trait::async_trait;
use courier_protocol::Envelope;
use serde_json::Value;

/// Failure reported by a handler
///
/// Converted at the Router boundary into a structured failure payload;
/// it never propagates as an unhandled fault.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// A registered endpoint handler
///
/// May return immediately or after awaiting its own I/O, and must not
/// assume which task or loop iteration it runs on.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, envelope: &Envelope) -> Result<Value, HandlerError>;
}
