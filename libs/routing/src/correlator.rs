//! Response Correlator
//!
//! Tracks every outstanding request by correlation id. Each pending entry
//! terminates exactly once: by a matching reply, by its deadline timer, or
//! by explicit cancellation. Exactly-once is structural — completing an
//! entry requires winning the atomic removal from the pending map, so a
//! late or duplicate reply finds nothing and becomes a no-op.

use crate::{Result, RouteError};
use courier_protocol::CorrelationId;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default deadline for a pending request
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Default cap on outstanding entries
pub const DEFAULT_MAX_PENDING: usize = 8192;

struct PendingEntry {
    tx: oneshot::Sender<Result<Value>>,
    timer: Option<JoinHandle<()>>,
}

/// Completion handle for one outstanding request
#[derive(Debug)]
pub struct PendingHandle {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingHandle {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Wait for the request to terminate
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(result) => result,
            // The entry was dropped without completing; treat it like a
            // lost connection rather than hanging the caller
            Err(_) => Err(RouteError::Transport(
                courier_transport::TransportError::connection(
                    "Pending request abandoned",
                    None,
                ),
            )),
        }
    }
}

/// Tracks outstanding requests until each terminates exactly once
pub struct Correlator {
    pending: Arc<DashMap<String, PendingEntry>>,
    deadline: Duration,
    max_pending: usize,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_DEADLINE)
    }
}

impl Correlator {
    pub fn new(deadline: Duration) -> Self {
        Self::with_limits(deadline, DEFAULT_MAX_PENDING)
    }

    pub fn with_limits(deadline: Duration, max_pending: usize) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            deadline,
            max_pending,
        }
    }

    /// Generate a correlation id unique within this process
    pub fn generate_id(&self) -> CorrelationId {
        CorrelationId::generate()
    }

    /// Create a pending entry with the default deadline
    pub fn create_pending(&self, id: &CorrelationId) -> Result<PendingHandle> {
        self.create_pending_with_deadline(id, self.deadline)
    }

    /// Create a pending entry with an explicit deadline
    pub fn create_pending_with_deadline(
        &self,
        id: &CorrelationId,
        deadline: Duration,
    ) -> Result<PendingHandle> {
        if self.pending.len() >= self.max_pending {
            warn!(
                "Rejecting request {}: {} outstanding entries",
                id, self.max_pending
            );
            return Err(RouteError::PendingLimit {
                limit: self.max_pending,
            });
        }

        let key = id.as_str().to_string();
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RouteError::Validation(format!(
                    "Correlation id {} already pending",
                    id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(PendingEntry { tx, timer: None });
            }
        }

        // The timer owns removal on expiry; whoever removes the entry first
        // is the one completion that happens
        let pending = self.pending.clone();
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some((_, entry)) = pending.remove(&timer_key) {
                debug!("Request {} timed out after {:?}", timer_key, deadline);
                let _ = entry.tx.send(Err(RouteError::CorrelationTimeout {
                    correlation_id: timer_key.clone(),
                    timeout_ms: deadline.as_millis() as u64,
                }));
            }
        });
        if let Some(mut entry) = self.pending.get_mut(&key) {
            entry.timer = Some(timer);
        }

        Ok(PendingHandle {
            correlation_id: id.clone(),
            rx,
        })
    }

    /// Fulfill a pending entry with a reply payload
    ///
    /// Unknown ids — late, duplicate, or already resolved — are a silent
    /// no-op, which is what protects against duplicate delivery.
    pub fn resolve(&self, id: &str, payload: Value) -> bool {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                let _ = entry.tx.send(Ok(payload));
                true
            }
            None => {
                debug!("Ignoring reply for unknown correlation id {}", id);
                false
            }
        }
    }

    /// Fail a pending entry explicitly (connection loss, shutdown)
    pub fn cancel(&self, id: &str, error: RouteError) -> bool {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                let _ = entry.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Whether a correlation id is still awaiting its reply
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of requests currently awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
