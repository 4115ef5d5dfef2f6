//! Connection Registry
//!
//! Tracks live peer connections and which correlation ids each one owns.
//! Disconnect purges both: the registry entry and every owned correlation,
//! failing the matching correlator pendings so callers fail promptly
//! instead of waiting out their deadline.

use crate::correlator::Correlator;
use crate::{Result, RouteError};
use courier_protocol::{CorrelationId, Envelope};
use courier_transport::{EnvelopeSink, TransportError};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default cap on outstanding correlations per client connection
pub const DEFAULT_PER_CLIENT_CAP: usize = 1024;

struct ClientConnection {
    sink: Arc<dyn EnvelopeSink>,
    owned: HashSet<String>,
}

/// Live peer connections and their in-flight correlation ids
pub struct ConnectionRegistry {
    clients: DashMap<String, ClientConnection>,
    correlations: DashMap<String, String>,
    correlator: Arc<Correlator>,
    per_client_cap: usize,
}

impl ConnectionRegistry {
    pub fn new(correlator: Arc<Correlator>) -> Self {
        Self::with_cap(correlator, DEFAULT_PER_CLIENT_CAP)
    }

    pub fn with_cap(correlator: Arc<Correlator>, per_client_cap: usize) -> Self {
        Self {
            clients: DashMap::new(),
            correlations: DashMap::new(),
            correlator,
            per_client_cap,
        }
    }

    /// Record a live peer connection
    pub fn register_client(&self, sink: Arc<dyn EnvelopeSink>, client_id: impl Into<String>) {
        let client_id = client_id.into();
        debug!("Registered client connection {}", client_id);
        self.clients.insert(
            client_id,
            ClientConnection {
                sink,
                owned: HashSet::new(),
            },
        );
    }

    /// Associate an outstanding request with the connection that must
    /// receive its reply
    pub fn register_correlation(&self, correlation_id: &CorrelationId, client_id: &str) -> Result<()> {
        let mut client = self.clients.get_mut(client_id).ok_or_else(|| {
            RouteError::Transport(TransportError::connection(
                "Unknown client connection",
                Some(client_id),
            ))
        })?;
        if client.owned.len() >= self.per_client_cap {
            warn!(
                "Client {} has {} outstanding requests, rejecting",
                client_id, self.per_client_cap
            );
            return Err(RouteError::PendingLimit {
                limit: self.per_client_cap,
            });
        }
        client.owned.insert(correlation_id.as_str().to_string());
        drop(client);

        self.correlations
            .insert(correlation_id.as_str().to_string(), client_id.to_string());
        Ok(())
    }

    /// Whether any connection currently owns this correlation id
    pub fn has_correlation(&self, correlation_id: &str) -> bool {
        self.correlations.contains_key(correlation_id)
    }

    /// Write a response back to the connection owning its correlation id
    ///
    /// Returns false without writing when the correlation is unknown or the
    /// connection is missing or closed; a reply whose peer disconnected
    /// mid-flight is simply dropped here, logged, never raised.
    pub async fn send_response(&self, envelope: &Envelope) -> bool {
        let Some(correlation_id) = envelope.correlation_id() else {
            warn!("Dropping response without a correlation id");
            return false;
        };
        let key = correlation_id.as_str();

        let Some(client_id) = self.correlations.get(key).map(|e| e.value().clone()) else {
            debug!("No connection owns correlation {}; dropping response", key);
            return false;
        };
        let Some(sink) = self.clients.get(&client_id).map(|c| c.sink.clone()) else {
            debug!(
                "Connection {} gone before response for {}; dropping",
                client_id, key
            );
            return false;
        };
        if !sink.is_open() {
            warn!(
                "Connection {} closed before response for {}; dropping",
                client_id, key
            );
            return false;
        }

        match sink.send(envelope).await {
            Ok(()) => {
                // One response per request; the correlation is consumed
                self.release_correlation(key);
                true
            }
            Err(e) => {
                warn!("Failed to write response for {}: {}", key, e);
                false
            }
        }
    }

    /// Connection currently owning a correlation id
    pub fn correlation_owner(&self, correlation_id: &str) -> Option<String> {
        self.correlations
            .get(correlation_id)
            .map(|e| e.value().clone())
    }

    /// Drop a correlation entry without writing anything (reply consumed
    /// locally, or abandoned)
    pub fn release_correlation(&self, correlation_id: &str) {
        if let Some((_, client_id)) = self.correlations.remove(correlation_id) {
            if let Some(mut client) = self.clients.get_mut(&client_id) {
                client.owned.remove(correlation_id);
            }
        }
    }

    /// Remove a connection and purge every correlation id it owned
    ///
    /// Pendings waiting on this connection are cancelled so their callers
    /// fail now rather than at the deadline. Returns how many correlations
    /// were purged.
    pub fn unregister_client(&self, client_id: &str) -> usize {
        let Some((_, client)) = self.clients.remove(client_id) else {
            return 0;
        };
        let purged = client.owned.len();
        for correlation_id in client.owned {
            self.correlations.remove(&correlation_id);
            self.correlator.cancel(
                &correlation_id,
                RouteError::Transport(TransportError::connection(
                    "Peer disconnected before replying",
                    Some(client_id),
                )),
            );
        }
        info!(
            "Client {} unregistered, purged {} correlation(s)",
            client_id, purged
        );
        purged
    }

    /// Sink of a registered connection, for direct writes outside the
    /// correlation path
    pub fn sink(&self, client_id: &str) -> Option<Arc<dyn EnvelopeSink>> {
        self.clients.get(client_id).map(|c| c.sink.clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_protocol::{Context, Environment};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct RecordingSink {
        peer: String,
        open: AtomicBool,
        sent: Mutex<Vec<Envelope>>,
    }

    impl RecordingSink {
        fn new(peer: &str) -> Arc<Self> {
            Arc::new(Self {
                peer: peer.to_string(),
                open: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn close(&self) {
            self.open.store(false, Ordering::Release);
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl EnvelopeSink for RecordingSink {
        async fn send(&self, envelope: &Envelope) -> courier_transport::Result<()> {
            if !self.is_open() {
                return Err(TransportError::connection("closed", Some(&self.peer)));
            }
            self.sent.lock().push(envelope.clone());
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        fn peer_id(&self) -> &str {
            &self.peer
        }
    }

    fn request_and_response(id: &str) -> (Envelope, Envelope) {
        let caller = Context::new(Environment::Cli);
        let server = Context::new(Environment::Server);
        let request = Envelope::request(
            &caller,
            "cli",
            "server/commands/ping",
            json!({}),
            Some(CorrelationId::from(id)),
        );
        let response =
            Envelope::response(&server, "commands/ping", "cli", json!({"pong": 1}), &request);
        (request, response)
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(Correlator::default()))
    }

    #[tokio::test]
    async fn test_send_response_routes_to_owner() {
        let registry = registry();
        let sink = RecordingSink::new("conn-0");
        registry.register_client(sink.clone(), "conn-0");
        registry
            .register_correlation(&CorrelationId::from("req_1_abc"), "conn-0")
            .unwrap();

        let (_, response) = request_and_response("req_1_abc");
        assert!(registry.send_response(&response).await);
        assert_eq!(sink.sent_count(), 1);

        // The correlation is consumed; a duplicate response is dropped
        assert!(!registry.has_correlation("req_1_abc"));
        assert!(!registry.send_response(&response).await);
        assert_eq!(sink.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_send_response_unknown_correlation_returns_false() {
        let registry = registry();
        let (_, response) = request_and_response("req_7_nobody");
        assert!(!registry.send_response(&response).await);
    }

    #[tokio::test]
    async fn test_send_response_closed_connection_returns_false() {
        let registry = registry();
        let sink = RecordingSink::new("conn-0");
        registry.register_client(sink.clone(), "conn-0");
        registry
            .register_correlation(&CorrelationId::from("req_2_abc"), "conn-0")
            .unwrap();

        sink.close();

        let (_, response) = request_and_response("req_2_abc");
        assert!(!registry.send_response(&response).await);
        assert_eq!(sink.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_purges_every_owned_correlation() {
        let registry = registry();
        registry.register_client(RecordingSink::new("conn-0"), "conn-0");
        registry.register_client(RecordingSink::new("conn-1"), "conn-1");

        for id in ["req_1_a", "req_2_b", "req_3_c"] {
            registry
                .register_correlation(&CorrelationId::from(id), "conn-0")
                .unwrap();
        }
        registry
            .register_correlation(&CorrelationId::from("req_4_d"), "conn-1")
            .unwrap();

        assert_eq!(registry.unregister_client("conn-0"), 3);
        for id in ["req_1_a", "req_2_b", "req_3_c"] {
            assert!(!registry.has_correlation(id));
        }
        // Other connections are untouched
        assert!(registry.has_correlation("req_4_d"));
        assert_eq!(registry.client_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_before_deadline() {
        let correlator = Arc::new(Correlator::default());
        let registry = ConnectionRegistry::new(correlator.clone());
        registry.register_client(RecordingSink::new("conn-0"), "conn-0");

        let id = correlator.generate_id();
        let handle = correlator.create_pending(&id).unwrap();
        registry.register_correlation(&id, "conn-0").unwrap();

        registry.unregister_client("conn-0");

        // Fails now with a connection error, far inside the 30s deadline
        let err = tokio::time::timeout(std::time::Duration::from_millis(100), handle.wait())
            .await
            .expect("pending should fail immediately")
            .unwrap_err();
        assert!(matches!(err, RouteError::Transport(_)));
    }

    #[tokio::test]
    async fn test_disconnect_before_handler_finishes_drops_reply() {
        let registry = registry();
        let sink = RecordingSink::new("conn-0");
        registry.register_client(sink.clone(), "conn-0");
        registry
            .register_correlation(&CorrelationId::from("req_9_late"), "conn-0")
            .unwrap();

        // Peer disconnects while the handler is still running
        registry.unregister_client("conn-0");

        let (_, response) = request_and_response("req_9_late");
        assert!(!registry.send_response(&response).await);
        assert_eq!(sink.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_per_client_cap_rejects_excess() {
        let registry = ConnectionRegistry::with_cap(Arc::new(Correlator::default()), 2);
        registry.register_client(RecordingSink::new("conn-0"), "conn-0");

        registry
            .register_correlation(&CorrelationId::from("req_1_a"), "conn-0")
            .unwrap();
        registry
            .register_correlation(&CorrelationId::from("req_2_b"), "conn-0")
            .unwrap();
        let err = registry
            .register_correlation(&CorrelationId::from("req_3_c"), "conn-0")
            .unwrap_err();
        assert!(matches!(err, RouteError::PendingLimit { limit: 2 }));
    }

    #[tokio::test]
    async fn test_register_correlation_requires_known_client() {
        let registry = registry();
        let err = registry
            .register_correlation(&CorrelationId::from("req_1_a"), "ghost")
            .unwrap_err();
        assert!(matches!(err, RouteError::Transport(_)));
    }
}
