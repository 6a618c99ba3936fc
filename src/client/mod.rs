//! RTMP client side of the proxy
//!
//! Used to replay a client's publish or play on the backend that owns the
//! stream.

pub mod backend;

pub use backend::BackendClient;
