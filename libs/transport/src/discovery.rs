//! Peer Discovery Channel
//!
//! Optional UDP channel that announces this context on an interval and
//! learns which peers exist on the local network. Announcements carry the
//! context id and environment; the same socket also carries fire-and-forget
//! event envelopes to discovered peers. Losing this channel degrades
//! discovery only; the cross-context channel keeps working without it.

use crate::config::DiscoveryConfig;
use crate::{
    Result, Transport, TransportError, TransportEvent, TransportInfo, TransportKind,
};
use async_trait::async_trait;
use courier_protocol::{Context, Envelope, Environment};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Peers unseen for this many announce intervals are pruned
const STALE_INTERVALS: u32 = 3;

/// A peer learned from its announcements
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub uuid: uuid::Uuid,
    pub environment: Environment,
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

/// Everything that travels on the discovery socket
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
enum Datagram {
    Announce(Announcement),
    Envelope(Envelope),
}

#[derive(Debug, Serialize, Deserialize)]
struct Announcement {
    uuid: uuid::Uuid,
    environment: Environment,
}

/// UDP broadcast transport for peer discovery
pub struct PeerDiscoveryTransport {
    context: Context,
    config: DiscoveryConfig,
    socket: SyncMutex<Option<Arc<UdpSocket>>>,
    peers: Arc<DashMap<uuid::Uuid, PeerInfo>>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
    shut_down: Arc<AtomicBool>,
}

impl PeerDiscoveryTransport {
    pub fn new(context: Context, config: DiscoveryConfig) -> Self {
        Self {
            context,
            config,
            socket: SyncMutex::new(None),
            peers: Arc::new(DashMap::new()),
            tasks: SyncMutex::new(Vec::new()),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Discovered peers, most recently seen first
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        peers
    }

    fn stale_cutoff(&self) -> Duration {
        self.config.announce_interval() * STALE_INTERVALS
    }

    fn prune_stale(peers: &DashMap<uuid::Uuid, PeerInfo>, cutoff: Duration, now: Instant) {
        peers.retain(|_, peer| now.duration_since(peer.last_seen) < cutoff);
    }

    fn record_announcement(
        peers: &DashMap<uuid::Uuid, PeerInfo>,
        own_uuid: uuid::Uuid,
        announcement: Announcement,
        addr: SocketAddr,
    ) {
        if announcement.uuid == own_uuid {
            return;
        }
        let is_new = !peers.contains_key(&announcement.uuid);
        peers.insert(
            announcement.uuid,
            PeerInfo {
                uuid: announcement.uuid,
                environment: announcement.environment,
                addr,
                last_seen: Instant::now(),
            },
        );
        if is_new {
            info!(
                "Discovered peer {} ({}) at {}",
                announcement.uuid, announcement.environment, addr
            );
        }
    }
}

#[async_trait]
impl Transport for PeerDiscoveryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PeerDiscovery
    }

    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.port))
            .await
            .map_err(|e| {
                TransportError::network_with_source(
                    format!("Failed to bind discovery port {}", self.config.port),
                    e,
                )
            })?;
        socket.set_broadcast(true).map_err(|e| {
            TransportError::network_with_source("Failed to enable UDP broadcast", e)
        })?;
        let socket = Arc::new(socket);
        *self.socket.lock() = Some(socket.clone());

        info!("Peer discovery announcing on UDP port {}", self.config.port);

        // Announce loop, which also prunes peers that went quiet
        let announce_socket = socket.clone();
        let announce_peers = self.peers.clone();
        let own = Announcement {
            uuid: self.context.uuid(),
            environment: self.context.environment(),
        };
        let interval = self.config.announce_interval();
        let cutoff = self.stale_cutoff();
        let port = self.config.port;
        let announce_task = tokio::spawn(async move {
            let datagram = match serde_json::to_vec(&Datagram::Announce(own)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to serialize announcement: {}", e);
                    return;
                }
            };
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = announce_socket
                    .send_to(&datagram, (Ipv4Addr::BROADCAST, port))
                    .await
                {
                    debug!("Announcement send failed: {}", e);
                }
                Self::prune_stale(&announce_peers, cutoff, Instant::now());
            }
        });

        // Receive loop for announcements and broadcast envelopes
        let recv_socket = socket;
        let recv_peers = self.peers.clone();
        let own_uuid = self.context.uuid();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (len, addr) = match recv_socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("Discovery receive failed: {}", e);
                        break;
                    }
                };
                match serde_json::from_slice::<Datagram>(&buf[..len]) {
                    Ok(Datagram::Announce(announcement)) => {
                        Self::record_announcement(&recv_peers, own_uuid, announcement, addr);
                    }
                    Ok(Datagram::Envelope(envelope)) => {
                        if events
                            .send(TransportEvent::Envelope {
                                transport: TransportKind::PeerDiscovery,
                                peer_id: addr.to_string(),
                                envelope,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Ignoring unparseable datagram from {}: {}", addr, e);
                    }
                }
            }
        });

        self.tasks.lock().extend([announce_task, recv_task]);
        Ok(())
    }

    async fn send(&self, destination: Environment, envelope: &Envelope) -> Result<String> {
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or_else(|| TransportError::network("Discovery channel not started"))?;

        let datagram = serde_json::to_vec(&Datagram::Envelope(envelope.clone()))
            .map_err(|e| TransportError::network_with_source("Failed to serialize envelope", e))?;

        let targets: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|entry| entry.value().environment == destination)
            .map(|entry| entry.value().addr)
            .collect();

        if targets.is_empty() {
            debug!("No discovered peers for environment '{}'", destination);
            return Ok(format!("discovery:{}", destination));
        }

        // Fire and forget; a lost datagram is within this channel's contract
        for addr in targets {
            if let Err(e) = socket.send_to(&datagram, addr).await {
                debug!("Broadcast to {} failed: {}", addr, e);
            }
        }
        Ok(format!("discovery:{}", destination))
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.socket.lock() = None;
        self.peers.clear();
        info!("Peer discovery channel shut down");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire) && self.socket.lock().is_some()
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            kind: TransportKind::PeerDiscovery,
            local_address: Some(format!("udp://0.0.0.0:{}", self.config.port)),
            peer_count: self.peers.len(),
        }
    }
}
