//! # Courier Transport
//!
//! Pluggable channel implementations moving serialized envelopes between
//! contexts, behind one uniform send/receive surface. The cross-context
//! Unix-socket channel is the default; the UDP peer-discovery channel is
//! optional and the process stays usable without it.
//!
//! Every live channel feeds one normalized [`TransportEvent`] stream, so the
//! routing layer never cares which channel a frame arrived on.

use async_trait::async_trait;
use courier_protocol::{Envelope, Environment};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod config;
pub mod discovery;
pub mod error;
pub mod strategy;
pub mod unix;

pub use config::{DiscoveryConfig, TransportConfig};
pub use discovery::{PeerDiscoveryTransport, PeerInfo};
pub use error::{Result, TransportError};
pub use strategy::{StrategyStatus, TransportFactory, TransportStrategy};
pub use unix::CrossContextTransport;

/// Transport kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Unix-socket channel between co-located contexts
    CrossContext,
    /// UDP announcement channel for peer discovery and broadcast
    PeerDiscovery,
}

/// Normalized inbound event emitted by every transport
#[derive(Debug)]
pub enum TransportEvent {
    /// A peer connection opened (server-side accept or client connect)
    PeerConnected {
        peer_id: String,
        sink: Arc<dyn EnvelopeSink>,
    },
    /// A peer connection closed or was lost
    PeerDisconnected { peer_id: String },
    /// A decoded envelope arrived from a peer
    Envelope {
        transport: TransportKind,
        peer_id: String,
        envelope: Envelope,
    },
}

/// Write half of one peer connection
///
/// The routing layer holds these in its connection registry so responses can
/// be written back without the transport knowing anything about correlation.
#[async_trait]
pub trait EnvelopeSink: Send + Sync + Debug {
    /// Serialize and write one envelope frame to the peer
    async fn send(&self, envelope: &Envelope) -> Result<()>;

    /// Whether the underlying connection is still writable
    fn is_open(&self) -> bool;

    /// Identifier of the peer this sink writes to
    fn peer_id(&self) -> &str;
}

/// Uniform surface over one channel implementation
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Start the channel, delivering every inbound event to `events`
    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<()>;

    /// Send an envelope toward a destination environment, returning the id
    /// of the peer it was sent through
    async fn send(&self, destination: Environment, envelope: &Envelope) -> Result<String>;

    /// Stop the channel; safe to call more than once
    async fn shutdown(&self) -> Result<()>;

    /// Whether the channel is currently able to carry traffic
    fn is_healthy(&self) -> bool;

    /// Channel information for operational visibility
    fn info(&self) -> TransportInfo;
}

/// Transport information for monitoring
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub kind: TransportKind,
    pub local_address: Option<String>,
    pub peer_count: usize,
}
