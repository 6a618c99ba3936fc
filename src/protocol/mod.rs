//! RTMP wire protocol: handshake, chunk stream, messages

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkReader, ChunkWriter};
pub use message::{Command, RtmpMessage};
