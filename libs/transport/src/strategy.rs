//! Transport Strategy
//!
//! Composes the configured channels for one context behind a uniform
//! send/receive surface. The cross-context channel is mandatory; the
//! peer-discovery channel is optional and a failure to start it degrades
//! the set instead of aborting process startup.

use crate::config::TransportConfig;
use crate::discovery::PeerDiscoveryTransport;
use crate::unix::CrossContextTransport;
use crate::{
    Result, Transport, TransportError, TransportEvent, TransportInfo, TransportKind,
};
use courier_protocol::{Context, Envelope, Environment, MessageType};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of the normalized inbound event stream
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Builds transport instances for a context
pub struct TransportFactory;

impl TransportFactory {
    /// Create the transport for one kind, unstarted
    pub fn create(
        kind: TransportKind,
        context: &Context,
        config: &TransportConfig,
    ) -> Arc<dyn Transport> {
        match kind {
            TransportKind::CrossContext => {
                // The server environment owns the socket; everyone else dials it
                let transport = if context.environment() == Environment::Server {
                    CrossContextTransport::server(config.clone())
                } else {
                    CrossContextTransport::client(config.clone())
                };
                Arc::new(transport)
            }
            TransportKind::PeerDiscovery => Arc::new(PeerDiscoveryTransport::new(
                context.clone(),
                config.discovery.clone(),
            )),
        }
    }
}

/// Live transport kinds and their peer counts
#[derive(Debug, Clone)]
pub struct StrategyStatus {
    pub transports: Vec<TransportInfo>,
    pub discovery_active: bool,
}

impl StrategyStatus {
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }
}

/// The set of live transports for one context
pub struct TransportStrategy {
    transports: RwLock<HashMap<TransportKind, Arc<dyn Transport>>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: SyncMutex<Option<mpsc::Receiver<TransportEvent>>>,
    shut_down: AtomicBool,
}

impl TransportStrategy {
    /// Build one transport per applicable kind for this context
    ///
    /// Nothing is started yet; call [`setup_message_handlers`] to bring the
    /// channels up and obtain the normalized inbound stream.
    ///
    /// [`setup_message_handlers`]: TransportStrategy::setup_message_handlers
    pub fn initialize(context: &Context, config: &TransportConfig) -> Self {
        let mut transports: HashMap<TransportKind, Arc<dyn Transport>> = HashMap::new();
        transports.insert(
            TransportKind::CrossContext,
            TransportFactory::create(TransportKind::CrossContext, context, config),
        );
        if config.discovery.enabled {
            transports.insert(
                TransportKind::PeerDiscovery,
                TransportFactory::create(TransportKind::PeerDiscovery, context, config),
            );
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transports: RwLock::new(transports),
            events_tx,
            events_rx: SyncMutex::new(Some(events_rx)),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Start every configured transport and return the single normalized
    /// inbound event stream
    ///
    /// A cross-context start failure is fatal; a discovery start failure
    /// logs, drops the channel, and leaves the set usable.
    pub async fn setup_message_handlers(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let receiver = self.events_rx.lock().take().ok_or_else(|| {
            TransportError::configuration("Message handlers already set up", None)
        })?;

        let transports: Vec<(TransportKind, Arc<dyn Transport>)> = self
            .transports
            .read()
            .iter()
            .map(|(kind, transport)| (*kind, transport.clone()))
            .collect();

        for (kind, transport) in transports {
            match transport.start(self.events_tx.clone()).await {
                Ok(()) => info!("Transport {:?} started", kind),
                Err(e) if kind == TransportKind::PeerDiscovery => {
                    warn!("Peer discovery unavailable, continuing without it: {}", e);
                    self.transports.write().remove(&kind);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(receiver)
    }

    /// Retrieve a live transport instance
    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.transports.read().get(&kind).cloned()
    }

    /// Send an envelope toward a destination environment
    ///
    /// Correlated traffic always takes the cross-context channel. Events
    /// fall back to discovery broadcast when no cross-context peer for the
    /// destination exists.
    pub async fn send(&self, destination: Environment, envelope: &Envelope) -> Result<String> {
        let cross = self
            .get(TransportKind::CrossContext)
            .ok_or_else(|| TransportError::network("No cross-context transport"))?;

        match cross.send(destination, envelope).await {
            Ok(peer_id) => Ok(peer_id),
            Err(e)
                if envelope.message_type() == MessageType::Event
                    && e.is_connection_error() =>
            {
                if let Some(discovery) = self.get(TransportKind::PeerDiscovery) {
                    debug!(
                        "Cross-context send to '{}' failed ({}), broadcasting via discovery",
                        destination, e
                    );
                    discovery.send(destination, envelope).await
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Disconnect and clear all transports; safe to call more than once
    pub async fn shutdown_all(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Transport set already shut down");
            return Ok(());
        }

        let transports: Vec<Arc<dyn Transport>> =
            self.transports.write().drain().map(|(_, t)| t).collect();
        for transport in transports {
            if let Err(e) = transport.shutdown().await {
                warn!("Transport shutdown failed: {}", e);
            }
        }
        info!("All transports shut down");
        Ok(())
    }

    /// Live transport kinds, counts, and discovery state
    pub fn status(&self) -> StrategyStatus {
        let transports: Vec<TransportInfo> = self
            .transports
            .read()
            .values()
            .map(|t| t.info())
            .collect();
        let discovery_active = self
            .transports
            .read()
            .get(&TransportKind::PeerDiscovery)
            .map(|t| t.is_healthy())
            .unwrap_or(false);
        StrategyStatus {
            transports,
            discovery_active,
        }
    }
}
