//! SRT UDP listener
//!
//! One task reads every datagram from the shared listener socket. Data
//! packets are dispatched inline, in arrival order. Handshakes run in their
//! own task because a conclusion waits on the backend, and a silent backend
//! must not hold up other connections. Packets of one connection still
//! serialize on its lock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::connection::SrtConnection;
use super::packet::{self, HandshakePacket};
use crate::error::{Result, ResultExt};
use crate::registry::BackendRegistry;

/// SRT relay settings
#[derive(Debug, Clone)]
pub struct SrtConfig {
    /// Connections without client traffic for this long are dropped
    pub idle_timeout: Duration,

    /// Bound on each backend read during the handshake relay
    pub handshake_timeout: Duration,

    /// Interval between idle sweeps
    pub cleanup_interval: Duration,
}

impl Default for SrtConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(10),
        }
    }
}

type SharedConnection = Arc<Mutex<SrtConnection>>;

/// SRT proxy server
pub struct SrtServer {
    socket: Arc<UdpSocket>,
    registry: Arc<BackendRegistry>,
    connections: DashMap<u32, SharedConnection>,
    config: SrtConfig,
    start: Instant,
    cancel: CancellationToken,
}

impl SrtServer {
    /// Bind the listener socket
    ///
    /// Cancelling `cancel` stops the read loop and every backend pump.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<BackendRegistry>,
        config: SrtConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .stage(format!("listen srt {addr}"))?;
        tracing::info!(addr = %socket.local_addr()?, "SRT server listening");

        Ok(Self {
            socket: Arc::new(socket),
            registry,
            connections: DashMap::new(),
            config,
            start: Instant::now(),
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Number of socket ids currently mapped to a connection
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Read datagrams until cancelled
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.cleanup(),
                result = self.socket.recv_from(&mut buf) => {
                    let (n, addr) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "SRT read failed");
                            continue;
                        }
                    };

                    let data = &buf[..n];
                    if packet::is_handshake(data) {
                        let server = Arc::clone(&self);
                        let data = data.to_vec();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_datagram(addr, &data).await {
                                tracing::warn!(peer = %addr, error = %e, "SRT handshake failed");
                            }
                        });
                    } else if let Err(e) = self.handle_datagram(addr, data).await {
                        tracing::warn!(peer = %addr, size = n, error = %e, "SRT packet dropped");
                    }
                }
            }
        }

        self.connections.clear();
        tracing::info!("SRT server stopped");
        Ok(())
    }

    /// Dispatch one client datagram
    pub async fn handle_datagram(&self, addr: SocketAddr, data: &[u8]) -> Result<()> {
        let mut socket_id = packet::socket_id_of(data);

        let handshake = if packet::is_handshake(data) {
            let hs = HandshakePacket::parse(data)?;
            if socket_id == 0 {
                socket_id = hs.srt_socket_id;
            }
            Some(hs)
        } else {
            None
        };

        let connection = Arc::clone(
            self.connections
                .entry(socket_id)
                .or_insert_with(|| {
                    tracing::debug!(socket_id = socket_id, peer = %addr, "New SRT connection");
                    Arc::new(Mutex::new(SrtConnection::new(
                        socket_id,
                        Arc::clone(&self.socket),
                        self.start,
                        self.config.handshake_timeout,
                        self.cancel.child_token(),
                    )))
                })
                .value(),
        );

        let new_socket_id = connection
            .lock()
            .await
            .handle_packet(handshake, addr, data, &self.registry)
            .await?;

        if new_socket_id != 0 && new_socket_id != socket_id {
            self.connections.insert(new_socket_id, connection);
        }
        Ok(())
    }

    /// Drop connections idle longer than the idle timeout
    pub fn cleanup(&self) {
        let idle = self.config.idle_timeout;
        self.connections.retain(|socket_id, connection| match connection.try_lock() {
            Ok(conn) => {
                let keep = conn.last_active().elapsed() < idle;
                if !keep {
                    tracing::debug!(
                        socket_id = *socket_id,
                        stream = conn.stream_url().unwrap_or_default(),
                        "SRT connection idle, dropped"
                    );
                }
                keep
            }
            Err(_) => true,
        });
    }
}
