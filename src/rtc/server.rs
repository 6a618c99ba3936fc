//! WebRTC UDP listener
//!
//! Sessions are announced by the WHIP/WHEP handler before any media flows.
//! The first STUN binding request carrying a known ICE username binds the
//! client address to that session; later packets are routed by address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::connection::RtcConnection;
use super::stun::{self, StunPacket};
use crate::error::{Result, ResultExt};
use crate::registry::BackendRegistry;

type SharedConnection = Arc<Mutex<RtcConnection>>;

/// WebRTC media proxy
pub struct RtcServer {
    socket: Arc<UdpSocket>,
    registry: Arc<BackendRegistry>,
    usernames: DashMap<String, SharedConnection>,
    addresses: DashMap<SocketAddr, SharedConnection>,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl RtcServer {
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<BackendRegistry>,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .stage(format!("listen webrtc {addr}"))?;
        tracing::info!(addr = %socket.local_addr()?, "WebRTC server listening");

        Ok(Self {
            socket: Arc::new(socket),
            registry,
            usernames: DashMap::new(),
            addresses: DashMap::new(),
            idle_timeout,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Number of sessions announced and not yet expired
    pub fn session_count(&self) -> usize {
        self.usernames.len()
    }

    /// Announce a session negotiated over WHIP/WHEP
    ///
    /// `username` is the ICE username the client will present in STUN,
    /// `{answer ufrag}:{offer ufrag}`. Registering the same username again
    /// replaces the previous session.
    pub fn register(&self, stream_url: &str, username: &str) {
        let connection = Arc::new(Mutex::new(RtcConnection::new(
            stream_url,
            username,
            Arc::clone(&self.socket),
            self.cancel.child_token(),
        )));
        self.usernames.insert(username.to_string(), connection);
        tracing::debug!(stream = %stream_url, ufrag = %username, "WebRTC session registered");
    }

    /// Read datagrams until cancelled
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        let mut ticker = tokio::time::interval(self.cleanup_interval());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.cleanup(),
                result = self.socket.recv_from(&mut buf) => {
                    let (n, addr) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "WebRTC read failed");
                            continue;
                        }
                    };

                    if let Err(e) = self.handle_datagram(addr, &buf[..n]).await {
                        tracing::warn!(peer = %addr, size = n, error = %e, "WebRTC packet dropped");
                    }
                }
            }
        }

        self.addresses.clear();
        self.usernames.clear();
        tracing::info!("WebRTC server stopped");
        Ok(())
    }

    /// Route one client datagram to its session
    pub async fn handle_datagram(&self, addr: SocketAddr, data: &[u8]) -> Result<()> {
        let connection = match self.lookup(addr, data)? {
            Some(connection) => connection,
            None => {
                tracing::trace!(
                    peer = %addr,
                    media = stun::is_rtp_or_rtcp(data),
                    "Datagram from unknown WebRTC peer"
                );
                return Ok(());
            }
        };

        let mut connection = connection.lock().await;
        connection.handle_packet(addr, data, &self.registry).await?;
        Ok(())
    }

    fn lookup(&self, addr: SocketAddr, data: &[u8]) -> Result<Option<SharedConnection>> {
        if stun::is_stun(data) {
            let packet = StunPacket::parse(data)?;
            if let Some(connection) = self.usernames.get(&packet.username) {
                let connection = Arc::clone(connection.value());
                self.addresses.insert(addr, Arc::clone(&connection));
                return Ok(Some(connection));
            }
        }

        Ok(self.addresses.get(&addr).map(|c| Arc::clone(c.value())))
    }

    /// Drop sessions idle longer than the idle timeout
    ///
    /// Sessions that never saw a packet count their idle time from
    /// registration.
    pub fn cleanup(&self) {
        let idle = self.idle_timeout;
        let expired = |connection: &SharedConnection| match connection.try_lock() {
            Ok(conn) => conn.last_active().elapsed() >= idle,
            Err(_) => false,
        };

        self.addresses.retain(|_, connection| !expired(connection));
        self.usernames.retain(|username, connection| {
            let keep = !expired(connection);
            if !keep {
                tracing::debug!(ufrag = %username, "WebRTC session idle, dropped");
            }
            keep
        });
    }

    fn cleanup_interval(&self) -> Duration {
        (self.idle_timeout / 4).max(Duration::from_millis(100))
    }
}
