//! WebRTC proxying
//!
//! Signaling (WHIP/WHEP) goes through the HTTP API, which forwards the offer
//! to a backend and registers the negotiated ICE username here. Media then
//! arrives on one public UDP port and is relayed per session.

pub mod connection;
pub mod sdp;
pub mod server;
pub mod stun;

pub use connection::RtcConnection;
pub use sdp::{ice_username, parse_ice_credentials, rewrite_candidates, IceCredentials};
pub use server::RtcServer;
