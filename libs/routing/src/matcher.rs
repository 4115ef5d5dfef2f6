//! Endpoint Matcher
//!
//! Hierarchical registry resolving an address string to its handlers.
//! Registrations form an implicit prefix hierarchy: a lookup tries the full
//! path first, then progressively drops trailing segments until it finds a
//! registered prefix. An exact registration always outranks a hierarchical
//! one for the same full address, which lets a specific handler override a
//! catch-all registered on a parent path.

use crate::handler::MessageHandler;
use courier_protocol::endpoint;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// How a lookup found its registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// The full address is registered
    Exact,
    /// A parent prefix of the address is registered
    Hierarchical,
}

/// Result of resolving an endpoint
#[derive(Clone)]
pub struct EndpointMatch {
    pub handlers: Vec<Arc<dyn MessageHandler>>,
    pub match_type: MatchType,
    pub matched_endpoint: String,
}

/// Hierarchical endpoint registry
#[derive(Default)]
pub struct EndpointMatcher {
    registrations: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
}

impl EndpointMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler at an endpoint; multiple handlers may share one
    /// endpoint and are invoked in registration order for events
    pub fn register(&self, endpoint: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.registrations
            .write()
            .entry(endpoint.into())
            .or_default()
            .push(handler);
    }

    /// Resolve an endpoint to its handlers
    ///
    /// Exact match always wins; otherwise trailing segments are dropped
    /// until a registered prefix is found.
    pub fn lookup(&self, endpoint: &str) -> Option<EndpointMatch> {
        let registrations = self.registrations.read();

        if let Some(handlers) = registrations.get(endpoint) {
            return Some(EndpointMatch {
                handlers: handlers.clone(),
                match_type: MatchType::Exact,
                matched_endpoint: endpoint.to_string(),
            });
        }

        endpoint::proper_prefixes(endpoint).find_map(|prefix| {
            registrations.get(prefix).map(|handlers| EndpointMatch {
                handlers: handlers.clone(),
                match_type: MatchType::Hierarchical,
                matched_endpoint: prefix.to_string(),
            })
        })
    }

    /// Every registration matching an endpoint, most specific first
    ///
    /// Event fan-out delivers to all matching levels: the exact endpoint
    /// plus every registered ancestor prefix.
    pub fn match_all(&self, endpoint: &str) -> Vec<Arc<dyn MessageHandler>> {
        let registrations = self.registrations.read();
        let mut handlers = Vec::new();

        if let Some(exact) = registrations.get(endpoint) {
            handlers.extend(exact.iter().cloned());
        }
        for prefix in endpoint::proper_prefixes(endpoint) {
            if let Some(ancestors) = registrations.get(prefix) {
                handlers.extend(ancestors.iter().cloned());
            }
        }
        handlers
    }

    /// Whether the full address itself is registered
    pub fn has_exact(&self, endpoint: &str) -> bool {
        self.registrations.read().contains_key(endpoint)
    }

    /// Total registered handlers across all endpoints
    pub fn subscriber_count(&self) -> usize {
        self.registrations.read().values().map(Vec::len).sum()
    }
}
