//! # Courier Routing
//!
//! The orchestration layer: classifies every envelope, dispatches requests
//! to registered handlers or forwards them cross-context, fans events out
//! to subscribers, and tracks each outstanding request until it terminates
//! exactly once by reply, timeout, or cancellation.

pub mod connections;
pub mod correlator;
pub mod handler;
pub mod matcher;
pub mod router;

pub use connections::ConnectionRegistry;
pub use correlator::{Correlator, PendingHandle};
pub use handler::{HandlerError, MessageHandler};
pub use matcher::{EndpointMatch, EndpointMatcher, MatchType};
pub use router::{failure_kind, failure_payload, RouteOutcome, Router};

use courier_transport::TransportError;

/// Routing errors
///
/// Every caller-visible failure carries one of these kinds; nothing in this
/// layer surfaces as an unhandled fault.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No handler registered for endpoint '{endpoint}'")]
    Routing { endpoint: String },

    #[error("Request {correlation_id} timed out after {timeout_ms}ms")]
    CorrelationTimeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("Too many outstanding requests (limit {limit})")]
    PendingLimit { limit: usize },
}

impl RouteError {
    /// Discriminant used in structured failure payloads
    pub fn kind(&self) -> &'static str {
        match self {
            RouteError::Validation(_) => "validation",
            RouteError::Routing { .. } => "routing",
            RouteError::CorrelationTimeout { .. } => "timeout",
            RouteError::Transport(_) => "transport",
            RouteError::Handler(_) => "handler",
            RouteError::PendingLimit { .. } => "pending-limit",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RouteError::CorrelationTimeout { .. })
    }
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RouteError>;
