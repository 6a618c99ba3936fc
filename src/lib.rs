//! # srs-proxy
//!
//! A stream-aware reverse proxy for a fleet of SRS media servers.
//!
//! Clients speak RTMP, SRT or WebRTC (WHIP/WHEP) to the proxy. Each session
//! is reduced to a canonical stream URL, the [`registry::BackendRegistry`]
//! picks the backend that owns that stream, and the session is relayed:
//!
//! - RTMP is terminated on both hops and relayed message by message;
//! - SRT handshakes are replayed against the backend, then datagrams flow
//!   through unchanged;
//! - WHIP/WHEP offers are forwarded over HTTP, answer candidates are
//!   rewritten to the proxy, and ICE/DTLS/SRTP datagrams are relayed by
//!   STUN username.
//!
//! Backends announce themselves with `POST /api/v1/srs/register` on the
//! system API.

pub mod amf;
pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod rtc;
pub mod server;
pub mod srt;
pub mod stream_url;

pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use registry::{BackendRegistry, BackendServer};

/// Crate version, reported by the versions API and the RTMP connect result
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server signature, `SRSProxy/x.y.z`
pub fn signature() -> String {
    format!("SRSProxy/{VERSION}")
}
