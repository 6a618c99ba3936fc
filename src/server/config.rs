//! RTMP front end configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::constants::{MAX_CHUNK_SIZE, PROXY_CHUNK_SIZE, WINDOW_ACK_SIZE};

/// RTMP front end options
#[derive(Debug, Clone)]
pub struct RtmpConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Chunk size announced to both the client and the backend
    pub chunk_size: u32,

    /// Window acknowledgement size announced to clients
    pub window_ack_size: u32,

    /// Peer bandwidth announced to clients
    pub peer_bandwidth: u32,

    /// Handshake must complete within this time
    pub handshake_timeout: Duration,

    /// Client commands up to publish/play must arrive within this time
    pub identify_timeout: Duration,

    /// Backend dial, handshake and publish/play setup must finish within this time
    pub backend_timeout: Duration,

    /// Disable Nagle's algorithm on both hops
    pub tcp_nodelay: bool,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 11935)),
            max_connections: 0,
            chunk_size: PROXY_CHUNK_SIZE,
            window_ack_size: WINDOW_ACK_SIZE,
            peer_bandwidth: WINDOW_ACK_SIZE,
            handshake_timeout: Duration::from_secs(10),
            identify_timeout: Duration::from_secs(30),
            backend_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
        }
    }
}

impl RtmpConfig {
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set chunk size, capped at the protocol maximum
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RtmpConfig::default();
        assert_eq!(config.bind_addr.port(), 11935);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.chunk_size, PROXY_CHUNK_SIZE);
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:1935".parse().unwrap();
        let config = RtmpConfig::with_addr(addr)
            .max_connections(50)
            .chunk_size(4096)
            .handshake_timeout(Duration::from_secs(5))
            .backend_timeout(Duration::from_secs(3));

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.backend_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_chunk_size_clamped() {
        assert_eq!(RtmpConfig::default().chunk_size(u32::MAX).chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(RtmpConfig::default().chunk_size(0).chunk_size, 1);
    }
}
