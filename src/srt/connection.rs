//! Per-socket SRT session
//!
//! The proxy answers the client's INDUCTION itself, because the backend is
//! unknown until the CONCLUSION arrives with a stream id. Once it does, the
//! proxy replays the whole handshake against the chosen backend and hands
//! the backend's CONCLUSION response back to the client:
//!
//! ```text
//! Client                  Proxy                    Backend
//!   |--- HS0 (cookie=0) --->|                         |
//!   |<-- HS1 (proxy cookie)-|                         |
//!   |--- HS2 (stream id) -->|--- HS0 (replayed) ----->|
//!   |                       |<-- HS1 (backend cookie)-|
//!   |                       |--- HS2 (backend cookie)>|
//!   |                       |<-- HS3 -----------------|
//!   |<-- HS3 (proxy cookie)-|                         |
//!   |<========== opaque relay in both directions ====>|
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::packet::{handshake_type, HandshakePacket, INDUCTION_MAGIC};
use crate::error::{Error, Result, ResultExt};
use crate::registry::BackendRegistry;
use crate::stream_url::srt_stream_url;

/// Cookie the proxy hands out in its INDUCTION response
pub const PROXY_SYN_COOKIE: u32 = 0x418D_5E4E;

const RECV_BUFFER_SIZE: usize = 65536;

/// State of one client socket
pub struct SrtConnection {
    socket_id: u32,
    listener: Arc<UdpSocket>,
    backend: Option<Arc<UdpSocket>>,
    start: Instant,
    io_timeout: Duration,

    handshake0: Option<HandshakePacket>,
    handshake1: Option<HandshakePacket>,
    handshake2: Option<HandshakePacket>,
    handshake3: Option<HandshakePacket>,

    stream_url: Option<String>,
    pump: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    last_active: Instant,
}

impl SrtConnection {
    /// Create a connection for `socket_id`
    ///
    /// `start` is the reference time for handshake timestamps. `io_timeout`
    /// bounds every read from the backend during the handshake relay.
    pub fn new(
        socket_id: u32,
        listener: Arc<UdpSocket>,
        start: Instant,
        io_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket_id,
            listener,
            backend: None,
            start,
            io_timeout,
            handshake0: None,
            handshake1: None,
            handshake2: None,
            handshake3: None,
            stream_url: None,
            pump: None,
            cancel,
            last_active: Instant::now(),
        }
    }

    /// Current socket id; changes to the backend's id after the handshake
    pub fn socket_id(&self) -> u32 {
        self.socket_id
    }

    pub fn stream_url(&self) -> Option<&str> {
        self.stream_url.as_deref()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// True once the backend handshake completed and the pump runs
    pub fn is_relaying(&self) -> bool {
        self.pump.is_some()
    }

    /// Handle one datagram from the client
    ///
    /// `handshake` is the parsed packet when `data` is a handshake. Returns
    /// the socket id the connection should be reachable under afterwards.
    pub async fn handle_packet(
        &mut self,
        handshake: Option<HandshakePacket>,
        addr: SocketAddr,
        data: &[u8],
        registry: &BackendRegistry,
    ) -> Result<u32> {
        self.last_active = Instant::now();

        match handshake {
            Some(packet) => self.handle_handshake(packet, addr, registry).await?,
            None => {
                if let Some(backend) = &self.backend {
                    backend.send(data).await.stage("write to backend")?;
                }
            }
        }

        Ok(self.socket_id)
    }

    async fn handle_handshake(
        &mut self,
        packet: HandshakePacket,
        addr: SocketAddr,
        registry: &BackendRegistry,
    ) -> Result<()> {
        if packet.syn_cookie == 0 {
            return self.handle_induction(packet, addr).await;
        }

        // A retransmitted conclusion after the backend already answered.
        if let Some(handshake3) = &self.handshake3 {
            tracing::debug!(socket_id = self.socket_id, "Resending SRT handshake 3");
            self.listener
                .send_to(&handshake3.encode(), addr)
                .await
                .stage("resend handshake 3")?;
            return Ok(());
        }

        self.handle_conclusion(packet, addr, registry).await
    }

    async fn handle_induction(&mut self, packet: HandshakePacket, addr: SocketAddr) -> Result<()> {
        tracing::debug!(socket_id = self.socket_id, handshake = %packet, "SRT handshake 0");

        let response = HandshakePacket {
            control_flag: packet.control_flag,
            timestamp: self.start.elapsed().as_micros() as u32,
            socket_id: packet.srt_socket_id,
            version: 5,
            extension_field: INDUCTION_MAGIC,
            init_sequence: packet.init_sequence,
            mtu: packet.mtu,
            flow_window: packet.flow_window,
            handshake_type: handshake_type::INDUCTION,
            srt_socket_id: packet.srt_socket_id,
            syn_cookie: PROXY_SYN_COOKIE,
            peer_ip: [127, 0, 0, 1].into(),
            ..Default::default()
        };

        self.listener
            .send_to(&response.encode(), addr)
            .await
            .stage("write handshake 1")?;
        tracing::debug!(socket_id = self.socket_id, handshake = %response, "SRT handshake 1");

        self.handshake0 = Some(packet);
        self.handshake1 = Some(response);
        Ok(())
    }

    async fn handle_conclusion(
        &mut self,
        packet: HandshakePacket,
        addr: SocketAddr,
        registry: &BackendRegistry,
    ) -> Result<()> {
        let stream_id = packet.stream_id().stage("parse stream id")?;
        tracing::debug!(socket_id = self.socket_id, stream_id = %stream_id, "SRT handshake 2");

        let (handshake0, proxy_cookie) = match (&self.handshake0, &self.handshake1) {
            (Some(hs0), Some(hs1)) => (hs0.clone(), hs1.syn_cookie),
            _ => {
                return Err(Error::ProtocolViolation(
                    "SRT conclusion before induction".into(),
                ))
            }
        };
        self.handshake2 = Some(packet.clone());

        let backend = self
            .connect_backend(&stream_id, registry)
            .await
            .stage(format!("connect backend for {stream_id}"))?;

        backend
            .send(&handshake0.encode())
            .await
            .stage("write handshake 0 to backend")?;
        let backend_hs1 = self.read_handshake(&backend).await.stage("read handshake 1")?;
        tracing::debug!(socket_id = self.socket_id, handshake = %backend_hs1, "Backend handshake 1");

        let mut relayed = packet;
        relayed.syn_cookie = backend_hs1.syn_cookie;
        backend
            .send(&relayed.encode())
            .await
            .stage("write handshake 2 to backend")?;

        let backend_hs3 = self.read_handshake(&backend).await.stage("read handshake 3")?;
        tracing::debug!(socket_id = self.socket_id, handshake = %backend_hs3, "Backend handshake 3");

        let mut handshake3 = backend_hs3;
        handshake3.syn_cookie = proxy_cookie;
        self.listener
            .send_to(&handshake3.encode(), addr)
            .await
            .stage("write handshake 3")?;

        let previous = self.socket_id;
        self.socket_id = handshake3.srt_socket_id;
        self.handshake3 = Some(handshake3);

        self.spawn_pump(backend, addr);
        tracing::info!(
            socket_id = self.socket_id,
            client_socket_id = previous,
            client = %addr,
            stream = self.stream_url.as_deref().unwrap_or_default(),
            "SRT session relaying"
        );
        Ok(())
    }

    async fn connect_backend(
        &mut self,
        stream_id: &str,
        registry: &BackendRegistry,
    ) -> Result<Arc<UdpSocket>> {
        if let Some(backend) = &self.backend {
            return Ok(Arc::clone(backend));
        }

        let stream_url = srt_stream_url(stream_id)?;
        let server = registry.pick(&stream_url).await?;
        let port = server.srt_port()?;
        let ip: IpAddr = server
            .ip
            .parse()
            .map_err(|_| Error::Configuration(format!("backend ip {}", server.ip)))?;

        let bind_addr: SocketAddr = if ip.is_ipv6() {
            "[::]:0".parse()
        } else {
            "0.0.0.0:0".parse()
        }
        .map_err(|_| Error::Configuration("local bind address".into()))?;

        let socket = UdpSocket::bind(bind_addr).await.stage("bind backend socket")?;
        socket
            .connect(SocketAddr::new(ip, port))
            .await
            .stage(format!("dial {}:{}", ip, port))?;

        tracing::debug!(stream = %stream_url, backend = %server, port = port, "SRT backend dialed");

        let socket = Arc::new(socket);
        self.backend = Some(Arc::clone(&socket));
        self.stream_url = Some(stream_url);
        Ok(socket)
    }

    /// Read the next handshake packet from the backend
    async fn read_handshake(&self, backend: &UdpSocket) -> Result<HandshakePacket> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let deadline = tokio::time::Instant::now() + self.io_timeout;

        loop {
            let n = tokio::time::timeout_at(deadline, backend.recv(&mut buf))
                .await
                .map_err(|_| Error::BackendUnavailable("backend handshake timed out".into()))??;

            if super::packet::is_handshake(&buf[..n]) {
                return HandshakePacket::parse(&buf[..n]);
            }
            tracing::trace!(size = n, "Skipping non-handshake packet from backend");
        }
    }

    fn spawn_pump(&mut self, backend: Arc<UdpSocket>, client: SocketAddr) {
        let listener = Arc::clone(&self.listener);
        let cancel = self.cancel.clone();
        let socket_id = self.socket_id;

        self.pump = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = backend.recv(&mut buf) => match result {
                        Ok(n) => n,
                        Err(e) => {
                            tracing::warn!(socket_id = socket_id, error = %e, "Read from SRT backend failed");
                            break;
                        }
                    },
                };

                if let Err(e) = listener.send_to(&buf[..n], client).await {
                    tracing::warn!(socket_id = socket_id, error = %e, "Write to SRT client failed");
                    break;
                }
            }
            tracing::debug!(socket_id = socket_id, "SRT backend pump stopped");
        }));
    }

    /// Stop the backend pump
    pub fn close(&mut self) {
        self.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for SrtConnection {
    fn drop(&mut self) {
        self.close();
    }
}
