//! Router
//!
//! The orchestrator: classifies each envelope, dispatches requests through
//! the endpoint matcher or forwards them cross-context through the
//! transport strategy, fans events out to subscribers, and manages the
//! correlation lifecycle. The receive loop never blocks on a handler;
//! request dispatch runs on its own task and the eventual response goes out
//! through the connection registry.

use crate::connections::ConnectionRegistry;
use crate::correlator::{Correlator, PendingHandle};
use crate::handler::MessageHandler;
use crate::matcher::EndpointMatcher;
use crate::{Result, RouteError};
use courier_protocol::endpoint::{self, Destination};
use courier_protocol::{Context, Envelope, Environment, MessageType};
use courier_transport::{TransportEvent, TransportStrategy};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Build a structured failure payload with a discriminant kind
pub fn failure_payload(kind: &str, message: &str) -> Value {
    json!({ "error": { "kind": kind, "message": message } })
}

/// Discriminant kind of a failure payload, if the payload is one
pub fn failure_kind(payload: &Value) -> Option<&str> {
    payload.get("error")?.get("kind")?.as_str()
}

/// Terminal state of one posted message
#[derive(Debug)]
pub enum RouteOutcome {
    /// Event fan-out acknowledgment
    Broadcast { delivered: usize },
    /// Local request answered without a network hop
    Responded(Envelope),
    /// Cross-context request in flight; await the handle for the reply
    Forwarded(PendingHandle),
    /// Response consumed by the correlator (true when it matched an
    /// outstanding request)
    Resolved(bool),
}

/// Per-context message orchestrator
pub struct Router {
    context: Context,
    matcher: EndpointMatcher,
    correlator: Arc<Correlator>,
    connections: Arc<ConnectionRegistry>,
    transports: Arc<TransportStrategy>,
}

impl Router {
    pub fn new(
        context: Context,
        correlator: Arc<Correlator>,
        connections: Arc<ConnectionRegistry>,
        transports: Arc<TransportStrategy>,
    ) -> Self {
        Self {
            context,
            matcher: EndpointMatcher::new(),
            correlator,
            connections,
            transports,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Register a handler at an endpoint
    pub fn register_subscriber(&self, endpoint: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.matcher.register(endpoint, handler);
    }

    /// Total registered handlers, for diagnostics
    pub fn subscriber_count(&self) -> usize {
        self.matcher.subscriber_count()
    }

    /// Route one envelope from a local caller
    pub async fn post_message(&self, envelope: Envelope) -> Result<RouteOutcome> {
        match envelope.message_type() {
            MessageType::Event => {
                if let Destination::Remote(destination) =
                    endpoint::classify(envelope.endpoint(), self.context.environment())
                {
                    // Fire and forget; a lost event is within contract
                    if let Err(e) = self.transports.send(destination, &envelope).await {
                        debug!("Event forward to '{}' failed: {}", destination, e);
                    }
                    return Ok(RouteOutcome::Broadcast { delivered: 0 });
                }
                let delivered = self.fan_out(&envelope).await;
                Ok(RouteOutcome::Broadcast { delivered })
            }
            MessageType::Request => {
                match endpoint::classify(envelope.endpoint(), self.context.environment()) {
                    Destination::Local => {
                        Ok(RouteOutcome::Responded(self.dispatch_local(&envelope).await?))
                    }
                    Destination::Remote(destination) => self.forward(envelope, destination).await,
                }
            }
            MessageType::Response => {
                let id = envelope.correlation_id().ok_or_else(|| {
                    RouteError::Validation("Response envelope missing correlation id".into())
                })?;
                let matched = self.correlator.resolve(id.as_str(), envelope.payload().clone());
                Ok(RouteOutcome::Resolved(matched))
            }
        }
    }

    /// Drive the normalized transport event stream until it closes
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                router.handle_transport_event(event).await;
            }
            debug!("Transport event stream closed");
        })
    }

    /// Single inbound entry point for everything the transports surface
    pub async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected { peer_id, sink } => {
                self.connections.register_client(sink, peer_id);
            }
            TransportEvent::PeerDisconnected { peer_id } => {
                self.connections.unregister_client(&peer_id);
            }
            TransportEvent::Envelope {
                peer_id, envelope, ..
            } => {
                self.handle_inbound(peer_id, envelope).await;
            }
        }
    }

    async fn handle_inbound(self: &Arc<Self>, peer_id: String, envelope: Envelope) {
        match envelope.message_type() {
            MessageType::Response => {
                let Some(id) = envelope.correlation_id() else {
                    warn!("Dropping response without correlation id from {}", peer_id);
                    return;
                };
                // Replies demultiplex strictly by correlation id, whatever
                // transport they arrived on
                if self.correlator.resolve(id.as_str(), envelope.payload().clone()) {
                    // Ours; the entry tying it to its carrying connection is spent
                    self.connections.release_correlation(id.as_str());
                    return;
                }
                match self.connections.correlation_owner(id.as_str()) {
                    // Relay toward the owning connection, never back to the
                    // connection the reply came in on
                    Some(owner) if owner != peer_id => {
                        if !self.connections.send_response(&envelope).await {
                            debug!("Relay of reply {} failed; dropping", id);
                        }
                    }
                    Some(_) => {
                        // Late or duplicate reply for a request this context
                        // already gave up on
                        self.connections.release_correlation(id.as_str());
                        debug!("Dropping late reply for {}", id);
                    }
                    None => debug!("Dropping reply for unknown correlation id {}", id),
                }
            }
            MessageType::Request => self.handle_inbound_request(peer_id, envelope).await,
            MessageType::Event => {
                if let Destination::Remote(destination) =
                    endpoint::classify(envelope.endpoint(), self.context.environment())
                {
                    if let Err(e) = self.transports.send(destination, &envelope).await {
                        debug!("Event relay to '{}' failed: {}", destination, e);
                    }
                    return;
                }
                let router = self.clone();
                tokio::spawn(async move {
                    let delivered = router.fan_out(&envelope).await;
                    debug!(
                        "Event '{}' delivered to {} subscriber(s)",
                        envelope.endpoint(),
                        delivered
                    );
                });
            }
        }
    }

    async fn handle_inbound_request(self: &Arc<Self>, peer_id: String, envelope: Envelope) {
        // Record the reply route first so the eventual response can find its
        // way back even if the handler completes after a long deferral
        if let Some(id) = envelope.correlation_id() {
            if let Err(e) = self.connections.register_correlation(id, &peer_id) {
                warn!("Rejecting request {} from {}: {}", id, peer_id, e);
                if let Some(sink) = self.connections.sink(&peer_id) {
                    let failure = Envelope::response(
                        &self.context,
                        endpoint::local_path(envelope.endpoint()),
                        envelope.origin(),
                        failure_payload(e.kind(), &e.to_string()),
                        &envelope,
                    );
                    if let Err(send_err) = sink.send(&failure).await {
                        debug!("Failed to deliver rejection for {}: {}", id, send_err);
                    }
                }
                return;
            }
        }

        match endpoint::classify(envelope.endpoint(), self.context.environment()) {
            Destination::Local => {
                // Never block the receive loop on a handler
                let router = self.clone();
                tokio::spawn(async move {
                    let response = router.dispatch_or_failure(&envelope).await;
                    if !router.connections.send_response(&response).await {
                        debug!(
                            "Reply for {:?} dropped; peer disconnected mid-flight",
                            envelope.correlation_id()
                        );
                    }
                });
            }
            Destination::Remote(destination) => {
                match self.transports.send(destination, &envelope).await {
                    Ok(next_hop) => debug!(
                        "Relayed request {:?} toward '{}' via {}",
                        envelope.correlation_id(),
                        destination,
                        next_hop
                    ),
                    Err(e) => {
                        warn!(
                            "Relay of {:?} to '{}' failed: {}",
                            envelope.correlation_id(),
                            destination,
                            e
                        );
                        let failure = Envelope::response(
                            &self.context,
                            endpoint::local_path(envelope.endpoint()),
                            envelope.origin(),
                            failure_payload("transport", &e.to_string()),
                            &envelope,
                        );
                        if !self.connections.send_response(&failure).await {
                            debug!("Relay failure reply also undeliverable");
                        }
                    }
                }
            }
        }
    }

    /// Resolve a handler and wrap its result as a response envelope
    ///
    /// A handler failure becomes a structured failure payload; only a
    /// missing registration is an error to the caller.
    async fn dispatch_local(&self, envelope: &Envelope) -> Result<Envelope> {
        let path = endpoint::local_path(envelope.endpoint());
        let matched = self.matcher.lookup(path).ok_or_else(|| RouteError::Routing {
            endpoint: envelope.endpoint().to_string(),
        })?;
        debug!(
            "Dispatching '{}' via {:?} match on '{}'",
            path, matched.match_type, matched.matched_endpoint
        );

        // Requests go to the first handler registered at the matched endpoint
        let handler = matched.handlers[0].clone();
        let payload = match handler.handle_message(envelope).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Handler for '{}' failed: {}", matched.matched_endpoint, e);
                failure_payload("handler", &e.to_string())
            }
        };

        Ok(Envelope::response(
            &self.context,
            matched.matched_endpoint,
            envelope.origin(),
            payload,
            envelope,
        ))
    }

    async fn dispatch_or_failure(&self, envelope: &Envelope) -> Envelope {
        match self.dispatch_local(envelope).await {
            Ok(response) => response,
            Err(e) => Envelope::response(
                &self.context,
                endpoint::local_path(envelope.endpoint()),
                envelope.origin(),
                failure_payload(e.kind(), &e.to_string()),
                envelope,
            ),
        }
    }

    /// Register the pending entry, send, and hand the caller its handle
    async fn forward(&self, envelope: Envelope, destination: Environment) -> Result<RouteOutcome> {
        let id = envelope.correlation_id().cloned().ok_or_else(|| {
            RouteError::Validation("Request envelope missing correlation id".into())
        })?;
        let handle = self.correlator.create_pending(&id)?;

        match self.transports.send(destination, &envelope).await {
            Ok(peer_id) => {
                // Tie the pending to its carrying connection so a disconnect
                // fails it promptly instead of at the deadline
                if let Err(e) = self.connections.register_correlation(&id, &peer_id) {
                    debug!("Correlation {} not tied to {}: {}", id, peer_id, e);
                } else if !self.correlator.is_pending(id.as_str()) {
                    // The reply beat the registration; drop the stale tie
                    self.connections.release_correlation(id.as_str());
                }
                Ok(RouteOutcome::Forwarded(handle))
            }
            Err(e) => {
                warn!("Forward of {} to '{}' failed: {}", id, destination, e);
                self.correlator.cancel(id.as_str(), RouteError::Transport(e));
                match handle.wait().await {
                    Err(error) => Err(error),
                    Ok(_) => Err(RouteError::Validation(
                        "Cancelled request resolved unexpectedly".into(),
                    )),
                }
            }
        }
    }

    /// Invoke every matching subscriber; one failure never reaches the
    /// sender or the sibling subscribers
    async fn fan_out(&self, envelope: &Envelope) -> usize {
        let path = endpoint::local_path(envelope.endpoint());
        let handlers = self.matcher.match_all(path);
        let delivered = handlers.len();
        for handler in handlers {
            if let Err(e) = handler.handle_message(envelope).await {
                warn!("Event subscriber for '{}' failed: {}", path, e);
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use async_trait::async_trait;
    use courier_transport::TransportConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Debug)]
    struct Recorder {
        reply: Value,
        fail: bool,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn replying(reply: Value) -> Arc<Self> {
            Arc::new(Self {
                reply,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Value::Null,
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(&self, _envelope: &Envelope) -> std::result::Result<Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HandlerError::new("boom"))
            } else {
                Ok(self.reply.clone())
            }
        }
    }

    fn test_router(dir: &tempfile::TempDir) -> Arc<Router> {
        let context = Context::new(Environment::Server);
        let config = TransportConfig {
            socket_path: dir.path().join("router.sock"),
            ..Default::default()
        };
        let correlator = Arc::new(Correlator::default());
        let connections = Arc::new(ConnectionRegistry::new(correlator.clone()));
        let transports = Arc::new(TransportStrategy::initialize(&context, &config));
        Arc::new(Router::new(context, correlator, connections, transports))
    }

    #[tokio::test]
    async fn test_local_request_returns_response_synchronously() {
        let dir = tempdir().unwrap();
        let router = test_router(&dir);
        router.register_subscriber("commands/ping", Recorder::replying(json!({"pong": true})));

        let request = Envelope::request(
            router.context(),
            "caller",
            "commands/ping",
            json!({}),
            None,
        );
        let correlation_id = request.correlation_id().cloned().unwrap();

        match router.post_message(request).await.unwrap() {
            RouteOutcome::Responded(response) => {
                assert!(response.is_response());
                assert_eq!(response.payload(), &json!({"pong": true}));
                assert_eq!(response.correlation_id(), Some(&correlation_id));
            }
            _ => panic!("expected a synchronous response"),
        }
    }

    #[tokio::test]
    async fn test_exact_handler_overrides_hierarchical() {
        let dir = tempdir().unwrap();
        let router = test_router(&dir);
        let catch_all = Recorder::replying(json!("general"));
        let specific = Recorder::replying(json!("specific"));
        router.register_subscriber("commands", catch_all.clone());
        router.register_subscriber("commands/ping", specific.clone());

        let request =
            Envelope::request(router.context(), "caller", "commands/ping", json!({}), None);
        match router.post_message(request).await.unwrap() {
            RouteOutcome::Responded(response) => {
                assert_eq!(response.payload(), &json!("specific"));
            }
            _ => panic!("expected a synchronous response"),
        }
        assert_eq!(specific.calls(), 1);
        assert_eq!(catch_all.calls(), 0);
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_structured_payload() {
        let dir = tempdir().unwrap();
        let router = test_router(&dir);
        router.register_subscriber("commands/broken", Recorder::failing());

        let request =
            Envelope::request(router.context(), "caller", "commands/broken", json!({}), None);
        match router.post_message(request).await.unwrap() {
            RouteOutcome::Responded(response) => {
                assert_eq!(failure_kind(response.payload()), Some("handler"));
            }
            _ => panic!("expected a synchronous response"),
        }
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_routing_error() {
        let dir = tempdir().unwrap();
        let router = test_router(&dir);

        let request =
            Envelope::request(router.context(), "caller", "missing/endpoint", json!({}), None);
        let err = router.post_message(request).await.unwrap_err();
        assert!(matches!(err, RouteError::Routing { .. }));
        assert_eq!(err.kind(), "routing");
    }

    #[tokio::test]
    async fn test_event_fans_out_to_all_even_when_one_fails() {
        let dir = tempdir().unwrap();
        let router = test_router(&dir);
        let first = Recorder::replying(json!(null));
        let broken = Recorder::failing();
        let parent = Recorder::replying(json!(null));
        router.register_subscriber("status/changed", first.clone());
        router.register_subscriber("status/changed", broken.clone());
        router.register_subscriber("status", parent.clone());

        let event = Envelope::event(router.context(), "notifier", "status/changed", json!({}));
        match router.post_message(event).await.unwrap() {
            RouteOutcome::Broadcast { delivered } => assert_eq!(delivered, 3),
            _ => panic!("expected a broadcast acknowledgment"),
        }
        assert_eq!(first.calls(), 1);
        assert_eq!(broken.calls(), 1);
        assert_eq!(parent.calls(), 1);
    }

    #[tokio::test]
    async fn test_event_with_no_subscribers_is_a_no_op() {
        let dir = tempdir().unwrap();
        let router = test_router(&dir);

        let event = Envelope::event(router.context(), "notifier", "nobody/listens", json!({}));
        match router.post_message(event).await.unwrap() {
            RouteOutcome::Broadcast { delivered } => assert_eq!(delivered, 0),
            _ => panic!("expected a broadcast acknowledgment"),
        }
    }

    #[tokio::test]
    async fn test_forward_without_peer_fails_typed_and_leaves_nothing_pending() {
        let dir = tempdir().unwrap();
        let router = test_router(&dir);

        let request = Envelope::request(
            router.context(),
            "caller",
            "browser/ui/refresh",
            json!({}),
            None,
        );
        let err = router.post_message(request).await.unwrap_err();
        assert!(matches!(err, RouteError::Transport(_)));
        assert!(!err.is_timeout());

        // The pending entry was cancelled, not leaked
        assert_eq!(router.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_count() {
        let dir = tempdir().unwrap();
        let router = test_router(&dir);
        assert_eq!(router.subscriber_count(), 0);

        router.register_subscriber("a", Recorder::replying(json!(null)));
        router.register_subscriber("a/b", Recorder::replying(json!(null)));
        assert_eq!(router.subscriber_count(), 2);
    }
}
