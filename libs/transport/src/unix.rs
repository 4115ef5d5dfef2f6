//! Cross-Context Socket Channel
//!
//! Unix domain socket transport carrying one length-prefixed envelope per
//! frame. The server environment binds and accepts; every other environment
//! connects as a client. Each accepted connection is split into concurrent
//! read and write halves so a slow peer never stalls the accept loop.

use crate::config::TransportConfig;
use crate::{
    EnvelopeSink, Result, Transport, TransportError, TransportEvent, TransportInfo, TransportKind,
};
use async_trait::async_trait;
use bytes::BytesMut;
use courier_protocol::{wire, Envelope, Environment, ProtocolError};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Peer id the client side assigns to its single upstream connection
pub const UPSTREAM_PEER_ID: &str = "server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// Unix socket transport for the cross-context channel
pub struct CrossContextTransport {
    config: TransportConfig,
    role: Role,
    peers: Arc<DashMap<String, PeerEntry>>,
    connection_counter: Arc<AtomicU64>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shut_down: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    sink: Arc<UnixEnvelopeSink>,
    /// Environment learned from the first envelope this peer sent
    environment: Arc<SyncMutex<Option<Environment>>>,
}

impl CrossContextTransport {
    /// Create the listening side of the channel
    pub fn server(config: TransportConfig) -> Self {
        Self::with_role(config, Role::Server)
    }

    /// Create a connecting side of the channel
    pub fn client(config: TransportConfig) -> Self {
        Self::with_role(config, Role::Client)
    }

    fn with_role(config: TransportConfig, role: Role) -> Self {
        Self {
            config,
            role,
            peers: Arc::new(DashMap::new()),
            connection_counter: Arc::new(AtomicU64::new(0)),
            tasks: SyncMutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn start_server(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        // Remove a stale socket file left by a previous run
        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path).map_err(|e| {
                TransportError::network_with_source("Failed to remove existing socket", e)
            })?;
        }
        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::network_with_source("Failed to create socket directory", e)
            })?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)
            .map_err(|e| TransportError::network_with_source("Failed to bind Unix socket", e))?;

        info!("Cross-context channel listening on {:?}", self.config.socket_path);

        let peers = self.peers.clone();
        let counter = self.connection_counter.clone();
        let config = self.config.clone();
        let shut_down = self.shut_down.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let id = format!("conn-{}", counter.fetch_add(1, Ordering::SeqCst));
                        debug!("Accepted cross-context connection {}", id);
                        spawn_connection(stream, id, None, &peers, &events, &config).await;
                    }
                    Err(e) => {
                        if !shut_down.load(Ordering::Acquire) {
                            warn!("Accept failed on cross-context channel: {}", e);
                        }
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(accept_task);
        Ok(())
    }

    async fn start_client(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let connect = UnixStream::connect(&self.config.socket_path);
        let stream = tokio::time::timeout(self.config.connect_timeout(), connect)
            .await
            .map_err(|_| {
                TransportError::timeout("connect", self.config.connect_timeout_ms)
            })?
            .map_err(|e| {
                TransportError::connection_with_source(
                    format!("Failed to connect to {:?}", self.config.socket_path),
                    Some(UPSTREAM_PEER_ID),
                    e,
                )
            })?;

        debug!("Connected to cross-context channel at {:?}", self.config.socket_path);

        spawn_connection(
            stream,
            UPSTREAM_PEER_ID.to_string(),
            Some(Environment::Server),
            &self.peers,
            &events,
            &self.config,
        )
        .await;
        Ok(())
    }

    fn find_peer(&self, destination: Environment) -> Option<Arc<UnixEnvelopeSink>> {
        self.peers.iter().find_map(|entry| {
            let tagged = *entry.value().environment.lock();
            (tagged == Some(destination)).then(|| entry.value().sink.clone())
        })
    }
}

#[async_trait]
impl Transport for CrossContextTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::CrossContext
    }

    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        match self.role {
            Role::Server => self.start_server(events).await?,
            Role::Client => self.start_client(events).await?,
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(&self, destination: Environment, envelope: &Envelope) -> Result<String> {
        let sink = match self.role {
            // The client's only peer is the server; destination prefixes
            // beyond that are the server's routing problem.
            Role::Client => self
                .peers
                .get(UPSTREAM_PEER_ID)
                .map(|entry| entry.sink.clone())
                .ok_or_else(|| {
                    TransportError::connection("Not connected", Some(UPSTREAM_PEER_ID))
                })?,
            Role::Server => self.find_peer(destination).ok_or_else(|| {
                TransportError::connection(
                    format!("No connected peer for environment '{}'", destination),
                    None,
                )
            })?,
        };
        sink.send(envelope).await?;
        Ok(sink.peer_id().to_string())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for entry in self.peers.iter() {
            entry.value().sink.mark_closed();
        }
        self.peers.clear();
        if self.role == Role::Server && self.config.socket_path.exists() {
            let _ = std::fs::remove_file(&self.config.socket_path);
        }
        info!("Cross-context channel shut down");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }
        match self.role {
            Role::Server => self.started.load(Ordering::Acquire),
            Role::Client => self.peers.contains_key(UPSTREAM_PEER_ID),
        }
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            kind: TransportKind::CrossContext,
            local_address: Some(self.config.socket_path.display().to_string()),
            peer_count: self.peers.len(),
        }
    }
}

impl Drop for CrossContextTransport {
    fn drop(&mut self) {
        if self.role == Role::Server && self.config.socket_path.exists() {
            let _ = std::fs::remove_file(&self.config.socket_path);
        }
    }
}

/// Write half of one cross-context connection
#[derive(Debug)]
pub struct UnixEnvelopeSink {
    peer_id: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    open: AtomicBool,
    max_message_size: usize,
}

impl UnixEnvelopeSink {
    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[async_trait]
impl EnvelopeSink for UnixEnvelopeSink {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::connection(
                "Connection closed",
                Some(&self.peer_id),
            ));
        }

        let body = wire::encode(envelope)?;
        if body.len() > self.max_message_size {
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge {
                size: body.len(),
                limit: self.max_message_size,
            }));
        }

        let mut writer = self.writer.lock().await;
        let write = async {
            writer
                .write_all(&(body.len() as u32).to_be_bytes())
                .await?;
            writer.write_all(&body).await?;
            writer.flush().await
        };
        write.await.map_err(|e| {
            self.mark_closed();
            TransportError::connection_with_source("Failed to write frame", Some(&self.peer_id), e)
        })?;

        debug!("Sent {} byte frame to {}", body.len(), self.peer_id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

/// Register a connection's sink, announce it, and spawn its read loop
async fn spawn_connection(
    stream: UnixStream,
    peer_id: String,
    known_environment: Option<Environment>,
    peers: &Arc<DashMap<String, PeerEntry>>,
    events: &mpsc::Sender<TransportEvent>,
    config: &TransportConfig,
) {
    let (read_half, write_half) = stream.into_split();
    let sink = Arc::new(UnixEnvelopeSink {
        peer_id: peer_id.clone(),
        writer: tokio::sync::Mutex::new(write_half),
        open: AtomicBool::new(true),
        max_message_size: config.max_message_size,
    });
    let entry = PeerEntry {
        sink: sink.clone(),
        environment: Arc::new(SyncMutex::new(known_environment)),
    };
    peers.insert(peer_id.clone(), entry.clone());

    if events
        .send(TransportEvent::PeerConnected {
            peer_id: peer_id.clone(),
            sink: sink.clone(),
        })
        .await
        .is_err()
    {
        // Event consumer is gone; nothing will ever read this connection
        peers.remove(&peer_id);
        return;
    }

    let peers = peers.clone();
    let events = events.clone();
    let config = config.clone();
    tokio::spawn(async move {
        read_loop(read_half, &peer_id, &entry, &events, &config).await;

        sink.mark_closed();
        peers.remove(&peer_id);
        debug!("Cross-context connection {} closed", peer_id);
        let _ = events
            .send(TransportEvent::PeerDisconnected { peer_id })
            .await;
    });
}

/// Read length-prefixed frames until EOF or a protocol violation
async fn read_loop(
    mut read_half: OwnedReadHalf,
    peer_id: &str,
    entry: &PeerEntry,
    events: &mpsc::Sender<TransportEvent>,
    config: &TransportConfig,
) {
    let mut read_buffer = BytesMut::with_capacity(config.buffer_size);

    loop {
        let mut len_bytes = [0u8; 4];
        if read_half.read_exact(&mut len_bytes).await.is_err() {
            break;
        }
        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > config.max_message_size {
            warn!(
                "Frame from {} of {} bytes exceeds maximum {}, dropping connection",
                peer_id, frame_len, config.max_message_size
            );
            break;
        }

        read_buffer.resize(frame_len, 0);
        if read_half.read_exact(&mut read_buffer).await.is_err() {
            break;
        }

        match wire::decode_limited(&read_buffer, config.max_message_size) {
            Ok(envelope) => {
                {
                    let mut environment = entry.environment.lock();
                    if environment.is_none() {
                        *environment = Some(envelope.context().environment());
                    }
                }

                if events
                    .send(TransportEvent::Envelope {
                        transport: TransportKind::CrossContext,
                        peer_id: peer_id.to_string(),
                        envelope,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                // Malformed peer input never takes the channel down
                warn!("Dropping malformed frame from {}: {}", peer_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::Context;
    use serde_json::json;
    use tempfile::tempdir;

    fn config_at(dir: &tempfile::TempDir) -> TransportConfig {
        TransportConfig {
            socket_path: dir.path().join("test.sock"),
            ..Default::default()
        }
    }

    async fn recv(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn test_request_reaches_server_and_response_returns() {
        let dir = tempdir().unwrap();
        let server = CrossContextTransport::server(config_at(&dir));
        let (server_tx, mut server_events) = mpsc::channel(16);
        server.start(server_tx).await.unwrap();

        let client = CrossContextTransport::client(config_at(&dir));
        let (client_tx, mut client_events) = mpsc::channel(16);
        client.start(client_tx).await.unwrap();

        let browser = Context::new(Environment::Browser);
        let request = Envelope::request(
            &browser,
            "ui/panel",
            "server/commands/ping",
            json!({"echo": 1}),
            None,
        );
        client.send(Environment::Server, &request).await.unwrap();

        // Client side sees its upstream peer immediately
        assert!(matches!(
            recv(&mut client_events).await,
            TransportEvent::PeerConnected { .. }
        ));

        let sink = match recv(&mut server_events).await {
            TransportEvent::PeerConnected { sink, .. } => sink,
            other => panic!("expected PeerConnected, got {:?}", other),
        };
        let received = match recv(&mut server_events).await {
            TransportEvent::Envelope { envelope, .. } => envelope,
            other => panic!("expected Envelope, got {:?}", other),
        };
        assert_eq!(received.endpoint(), "server/commands/ping");

        let server_ctx = Context::new(Environment::Server);
        let response = Envelope::response(
            &server_ctx,
            "commands/ping",
            "ui/panel",
            json!({"pong": 1}),
            &received,
        );
        sink.send(&response).await.unwrap();

        let reply = match recv(&mut client_events).await {
            TransportEvent::Envelope { envelope, .. } => envelope,
            other => panic!("expected Envelope, got {:?}", other),
        };
        assert_eq!(reply.correlation_id(), received.correlation_id());

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_send_requires_tagged_peer() {
        let dir = tempdir().unwrap();
        let server = CrossContextTransport::server(config_at(&dir));
        let (tx, _events) = mpsc::channel(16);
        server.start(tx).await.unwrap();

        let ctx = Context::new(Environment::Server);
        let event = Envelope::event(&ctx, "status", "browser/status/changed", json!({}));
        let result = server.send(Environment::Browser, &event).await;
        assert!(matches!(result, Err(TransportError::Connection { .. })));

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_kill_connection() {
        let dir = tempdir().unwrap();
        let server = CrossContextTransport::server(config_at(&dir));
        let (tx, mut events) = mpsc::channel(16);
        server.start(tx).await.unwrap();

        let mut raw = UnixStream::connect(dir.path().join("test.sock"))
            .await
            .unwrap();

        // Garbage frame first, then a valid envelope on the same connection
        let garbage = b"definitely not json";
        raw.write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        raw.write_all(garbage).await.unwrap();

        let ctx = Context::new(Environment::Cli);
        let request = Envelope::request(&ctx, "cli", "server/commands/ping", json!({}), None);
        let body = wire::encode(&request).unwrap();
        raw.write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        raw.write_all(&body).await.unwrap();
        raw.flush().await.unwrap();

        assert!(matches!(
            recv(&mut events).await,
            TransportEvent::PeerConnected { .. }
        ));
        let received = match recv(&mut events).await {
            TransportEvent::Envelope { envelope, .. } => envelope,
            other => panic!("expected Envelope, got {:?}", other),
        };
        assert_eq!(received.endpoint(), "server/commands/ping");

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_emits_peer_disconnected() {
        let dir = tempdir().unwrap();
        let server = CrossContextTransport::server(config_at(&dir));
        let (tx, mut events) = mpsc::channel(16);
        server.start(tx).await.unwrap();

        let raw = UnixStream::connect(dir.path().join("test.sock"))
            .await
            .unwrap();
        let connected_id = match recv(&mut events).await {
            TransportEvent::PeerConnected { peer_id, .. } => peer_id,
            other => panic!("expected PeerConnected, got {:?}", other),
        };

        drop(raw);

        let disconnected_id = match recv(&mut events).await {
            TransportEvent::PeerDisconnected { peer_id } => peer_id,
            other => panic!("expected PeerDisconnected, got {:?}", other),
        };
        assert_eq!(connected_id, disconnected_id);

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let dir = tempdir().unwrap();
        let server = CrossContextTransport::server(config_at(&dir));
        let (tx, _events) = mpsc::channel(16);
        server.start(tx).await.unwrap();

        server.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
        assert!(!server.is_healthy());
    }
}
