//! WebRTC media relay for one session
//!
//! A session is identified by its ICE username rather than by address:
//! the client may switch candidate pairs mid-session, so the backend pump
//! always answers to the most recent client address.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result, ResultExt};
use crate::registry::BackendRegistry;

/// One WHIP/WHEP session's media path
pub struct RtcConnection {
    stream_url: String,
    ufrag: String,
    listener: Arc<UdpSocket>,
    backend: Option<Arc<UdpSocket>>,
    client_addr: Option<watch::Sender<SocketAddr>>,
    pump: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    last_active: Instant,
}

impl RtcConnection {
    pub fn new(
        stream_url: impl Into<String>,
        ufrag: impl Into<String>,
        listener: Arc<UdpSocket>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream_url: stream_url.into(),
            ufrag: ufrag.into(),
            listener,
            backend: None,
            client_addr: None,
            pump: None,
            cancel,
            last_active: Instant::now(),
        }
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    pub fn ufrag(&self) -> &str {
        &self.ufrag
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    /// Forward a client datagram to the backend, dialing it on first use
    pub async fn handle_packet(
        &mut self,
        addr: SocketAddr,
        data: &[u8],
        registry: &BackendRegistry,
    ) -> Result<()> {
        self.last_active = Instant::now();

        let backend = match &self.backend {
            Some(backend) => Arc::clone(backend),
            None => self.connect_backend(addr, registry).await?,
        };

        if let Some(tx) = &self.client_addr {
            if *tx.borrow() != addr {
                tracing::debug!(ufrag = %self.ufrag, client = %addr, "WebRTC client address changed");
                tx.send_replace(addr);
            }
        }

        backend.send(data).await.stage("write to backend")?;
        Ok(())
    }

    async fn connect_backend(
        &mut self,
        client: SocketAddr,
        registry: &BackendRegistry,
    ) -> Result<Arc<UdpSocket>> {
        let server = registry.pick(&self.stream_url).await?;
        let port = server.rtc_port()?;
        let ip: IpAddr = server
            .ip
            .parse()
            .map_err(|_| Error::Configuration(format!("backend ip {}", server.ip)))?;

        let socket = UdpSocket::bind(if ip.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" })
            .await
            .stage("bind backend socket")?;
        socket
            .connect(SocketAddr::new(ip, port))
            .await
            .stage(format!("dial {ip}:{port}"))?;
        let socket = Arc::new(socket);

        let (tx, rx) = watch::channel(client);
        self.pump = Some(spawn_pump(
            Arc::clone(&socket),
            Arc::clone(&self.listener),
            rx,
            self.cancel.clone(),
            self.ufrag.clone(),
        ));
        self.client_addr = Some(tx);
        self.backend = Some(Arc::clone(&socket));

        tracing::info!(
            stream = %self.stream_url,
            ufrag = %self.ufrag,
            backend = %server,
            port = port,
            "WebRTC media relaying"
        );
        Ok(socket)
    }

    /// Stop the backend pump
    pub fn close(&mut self) {
        self.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for RtcConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_pump(
    backend: Arc<UdpSocket>,
    listener: Arc<UdpSocket>,
    client: watch::Receiver<SocketAddr>,
    cancel: CancellationToken,
    ufrag: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                result = backend.recv(&mut buf) => match result {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(ufrag = %ufrag, error = %e, "Read from WebRTC backend failed");
                        break;
                    }
                },
            };

            let addr = *client.borrow();
            if let Err(e) = listener.send_to(&buf[..n], addr).await {
                tracing::warn!(ufrag = %ufrag, error = %e, "Write to WebRTC client failed");
                break;
            }
        }
    })
}
