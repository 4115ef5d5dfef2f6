//! Message Envelopes
//!
//! The immutable message unit exchanged between contexts, plus the factory
//! constructors for its three variants. Requests carry a correlation id
//! (generated when the caller supplies none), responses copy their
//! originating request's id verbatim, and events carry none.

use crate::context::Context;
use crate::correlation::CorrelationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminant for the three envelope variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
}

/// The immutable message unit exchanged between contexts
///
/// Fields are private so an envelope in flight can never be mutated; build a
/// new one through the factory constructors instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    message_type: MessageType,
    context: Context,
    origin: String,
    endpoint: String,
    payload: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    correlation_id: Option<CorrelationId>,
}

impl Envelope {
    /// Create a request envelope, generating a correlation id if none is
    /// supplied
    pub fn request(
        context: &Context,
        origin: impl Into<String>,
        endpoint: impl Into<String>,
        payload: Value,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            message_type: MessageType::Request,
            context: context.clone(),
            origin: origin.into(),
            endpoint: endpoint.into(),
            payload,
            correlation_id: Some(correlation_id.unwrap_or_else(CorrelationId::generate)),
        }
    }

    /// Create a response envelope carrying the originating request's
    /// correlation id verbatim
    pub fn response(
        context: &Context,
        origin: impl Into<String>,
        endpoint: impl Into<String>,
        payload: Value,
        request: &Envelope,
    ) -> Self {
        Self {
            message_type: MessageType::Response,
            context: context.clone(),
            origin: origin.into(),
            endpoint: endpoint.into(),
            payload,
            correlation_id: request.correlation_id.clone(),
        }
    }

    /// Create an event envelope; events skip correlation entirely
    pub fn event(
        context: &Context,
        origin: impl Into<String>,
        endpoint: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_type: MessageType::Event,
            context: context.clone(),
            origin: origin.into(),
            endpoint: endpoint.into(),
            payload,
            correlation_id: None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn is_request(&self) -> bool {
        self.message_type == MessageType::Request
    }

    pub fn is_response(&self) -> bool {
        self.message_type == MessageType::Response
    }

    pub fn is_event(&self) -> bool {
        self.message_type == MessageType::Event
    }
}
