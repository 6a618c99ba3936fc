//! SRT relay
//!
//! The proxy terminates the SRT handshake far enough to read the stream id,
//! picks a backend, replays the handshake against it and then relays every
//! datagram opaquely.

pub mod connection;
pub mod packet;
pub mod server;

pub use connection::SrtConnection;
pub use packet::HandshakePacket;
pub use server::{SrtConfig, SrtServer};
