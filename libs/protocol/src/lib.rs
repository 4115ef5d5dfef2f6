//! # Courier Protocol
//!
//! Envelope, context, and wire-format types shared by every courier crate.
//! This crate defines the message unit exchanged between contexts and the
//! parsing rules for endpoint addresses; it knows nothing about transports
//! or dispatch.

pub mod context;
pub mod correlation;
pub mod endpoint;
pub mod envelope;
pub mod wire;

pub use context::{Context, Environment};
pub use correlation::CorrelationId;
pub use endpoint::Destination;
pub use envelope::{Envelope, MessageType};

/// Protocol-level errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {message}")]
    Malformed {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Unknown environment name: {0}")]
    UnknownEnvironment(String),

    #[error("Frame size {size} exceeds maximum {limit}")]
    FrameTooLarge { size: usize, limit: usize },
}

impl ProtocolError {
    /// Create a malformed-envelope error without an underlying cause
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a malformed-envelope error from a serde failure
    pub fn malformed_with_source(message: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Malformed {
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
