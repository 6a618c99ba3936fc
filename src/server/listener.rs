//! RTMP server listener
//!
//! Handles the TCP accept loop and spawns one session task per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ResultExt};
use crate::registry::BackendRegistry;
use crate::server::config::RtmpConfig;
use crate::server::session::RtmpSession;

/// RTMP proxy server
pub struct RtmpServer {
    listener: TcpListener,
    config: Arc<RtmpConfig>,
    registry: Arc<BackendRegistry>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
}

impl RtmpServer {
    /// Bind the listener
    ///
    /// Cancelling `cancel` stops accepting and tears down every session.
    pub async fn bind(
        config: RtmpConfig,
        registry: Arc<BackendRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .stage(format!("listen rtmp {}", config.bind_addr))?;
        tracing::info!(addr = %listener.local_addr()?, "RTMP server listening");

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Ok(Self {
            listener,
            config: Arc::new(config),
            registry,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled
    pub async fn run(&self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                    Err(e) => tracing::error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        tracing::info!("RTMP server stopped");
        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // The permit lives as long as the session task.
        let permit = match self.connection_semaphore {
            Some(ref sem) => match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            },
            None => None,
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id, peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let session = RtmpSession::new(
            session_id,
            peer_addr,
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
        );
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let _permit = permit;
            match session.run(socket, cancel).await {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => {
                    tracing::debug!(session_id, error = %e, "Connection closed by peer")
                }
                Err(e) => tracing::warn!(session_id, peer = %peer_addr, error = %e, "RTMP session failed"),
            }
            tracing::debug!(session_id, "Connection closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::AmfValue;
    use crate::client::BackendClient;
    use crate::protocol::chunk::read_command;
    use crate::protocol::constants::{msg_type, NC_CONNECT_SUCCESS, NS_PLAY_START, NS_PUBLISH_START};
    use crate::protocol::handshake::server_handshake;
    use crate::protocol::{ChunkReader, ChunkWriter, Command, RtmpMessage};
    use crate::registry::BackendServer;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    /// A minimal SRS: answers setup commands with stream id 7, reports every
    /// relayed media message and, for players, pushes one video frame.
    async fn mock_srs() -> (u16, mpsc::UnboundedReceiver<RtmpMessage>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            server_handshake(&mut stream).await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = ChunkReader::new(r);
            let mut writer = ChunkWriter::new(w);

            loop {
                let (_, cmd) = read_command(&mut reader, &mut writer).await.unwrap();
                let tid = cmd.transaction_id;
                let (reply, done) = match cmd.name.as_str() {
                    "connect" => (
                        Command::new("_result", tid, AmfValue::Null)
                            .with_arg(AmfValue::object([("code", NC_CONNECT_SUCCESS)])),
                        false,
                    ),
                    "createStream" => (
                        Command::new("_result", tid, AmfValue::Null).with_arg(7.0),
                        false,
                    ),
                    "publish" => (
                        Command::new("onStatus", 0.0, AmfValue::Null)
                            .with_arg(AmfValue::object([("code", NS_PUBLISH_START)])),
                        true,
                    ),
                    "play" => (
                        Command::new("onStatus", 0.0, AmfValue::Null)
                            .with_arg(AmfValue::object([("code", NS_PLAY_START)])),
                        true,
                    ),
                    _ => (Command::new("_result", tid, AmfValue::Null), false),
                };
                writer
                    .write_message(&RtmpMessage::command(5, 7, &reply))
                    .await
                    .unwrap();
                if done {
                    break;
                }
            }

            let frame = RtmpMessage::new(6, msg_type::VIDEO, 7, 20, Bytes::from_static(&[0x17, 0x00]));
            writer.write_message(&frame).await.unwrap();

            while let Ok(message) = reader.read_message().await {
                if !message.is_protocol_control() {
                    let _ = tx.send(message);
                }
            }
        });

        (port, rx)
    }

    async fn start_proxy(registry: Arc<BackendRegistry>) -> (SocketAddr, CancellationToken) {
        let cancel = CancellationToken::new();
        let config = RtmpConfig::with_addr("127.0.0.1:0".parse().unwrap());
        let server = RtmpServer::bind(config, registry, cancel.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });
        (addr, cancel)
    }

    async fn registry_with(port: u16) -> Arc<BackendRegistry> {
        let registry = Arc::new(BackendRegistry::new());
        let mut server = BackendServer::new("127.0.0.1", "srs", "svc", "1");
        server.rtmp = vec![port.to_string()];
        registry.update(server).await;
        registry
    }

    #[tokio::test]
    async fn test_publish_through_proxy() {
        let (backend_port, mut relayed) = mock_srs().await;
        let (proxy, cancel) = start_proxy(registry_with(backend_port).await).await;

        let tc_url = format!("rtmp://{proxy}/live");
        let mut client = BackendClient::connect("127.0.0.1", proxy.port(), &tc_url, 4096)
            .await
            .unwrap();
        client.publish("livestream").await.unwrap();
        assert_eq!(client.stream_id(), 1);

        let audio = RtmpMessage::new(4, msg_type::AUDIO, 1, 100, Bytes::from_static(&[0xAF, 0x01, 0x21]));
        client.write_message(&audio).await.unwrap();

        let message = relayed.recv().await.unwrap();
        assert_eq!(message.type_id, msg_type::AUDIO);
        assert_eq!(message.stream_id, 7);
        assert_eq!(message.timestamp, 100);
        assert_eq!(message.payload, audio.payload);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_play_through_proxy() {
        let (backend_port, _relayed) = mock_srs().await;
        let (proxy, cancel) = start_proxy(registry_with(backend_port).await).await;

        let tc_url = format!("rtmp://{proxy}/live");
        let mut client = BackendClient::connect("127.0.0.1", proxy.port(), &tc_url, 4096)
            .await
            .unwrap();
        client.play("livestream").await.unwrap();

        let frame = loop {
            let message = client.read_message().await.unwrap();
            if message.type_id == msg_type::VIDEO {
                break message;
            }
        };
        assert_eq!(frame.stream_id, 1);
        assert_eq!(frame.timestamp, 20);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_no_backend_closes_client() {
        let (proxy, cancel) = start_proxy(Arc::new(BackendRegistry::new())).await;

        let tc_url = format!("rtmp://{proxy}/live");
        let mut client = BackendClient::connect("127.0.0.1", proxy.port(), &tc_url, 4096)
            .await
            .unwrap();
        assert!(client.publish("livestream").await.is_err());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let cancel = CancellationToken::new();
        let config = RtmpConfig::with_addr("127.0.0.1:0".parse().unwrap()).max_connections(1);
        let server = RtmpServer::bind(config, Arc::new(BackendRegistry::new()), cancel.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });

        // The first connection holds the only permit while it sits in the handshake.
        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            tokio::io::AsyncReadExt::read(&mut second, &mut buf),
        )
        .await
        .unwrap()
        .unwrap_or(0);
        assert_eq!(n, 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let config = RtmpConfig::with_addr("127.0.0.1:0".parse().unwrap());
        let server = RtmpServer::bind(config, Arc::new(BackendRegistry::new()), cancel.clone())
            .await
            .unwrap();
        let task = tokio::spawn(async move { server.run().await });

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
