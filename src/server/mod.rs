//! RTMP front end
//!
//! Terminates client RTMP, learns whether the client publishes or plays,
//! replays that on the backend picked for the stream and relays messages.

pub mod config;
pub mod listener;
pub mod session;

pub use config::RtmpConfig;
pub use listener::RtmpServer;
pub use session::{ClientRole, Identity, RtmpSession};
