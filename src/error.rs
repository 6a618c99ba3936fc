//! Error types
//!
//! Every engine in the proxy reports failures through [`Error`]. The four
//! domain variants map onto how a failure is handled:
//!
//! - [`Error::Parse`]: malformed bytes, JSON, URL or stream-id. The input is
//!   dropped (UDP) or answered with a 500 (HTTP).
//! - [`Error::Configuration`]: a backend lacks the endpoint a session needs.
//! - [`Error::BackendUnavailable`]: nothing to route to, or the backend failed.
//! - [`Error::ProtocolViolation`]: a peer broke the protocol contract.
//!
//! None of them is fatal to a listener; only the affected session is aborted.

use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An error annotated with the relay stage that produced it
    #[error("{stage}: {source}")]
    Stage {
        stage: String,
        source: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("AMF error: {0}")]
    Amf(#[from] AmfError),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Wrap this error with the name of the stage that failed
    pub fn at(self, stage: impl Into<String>) -> Self {
        Error::Stage {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any stage annotations
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the root cause is a timed-out or closed socket
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self.root(),
            Error::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            )
        )
    }
}

/// Attach a stage name to any fallible result
pub trait ResultExt<T> {
    fn stage(self, stage: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().at(stage))
    }
}

/// AMF0 decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmfError {
    #[error("unexpected end of data")]
    UnexpectedEof,

    #[error("unknown type marker 0x{0:02x}")]
    UnknownMarker(u8),

    #[error("invalid object end marker")]
    InvalidObjectEnd,

    #[error("invalid reference index {0}")]
    InvalidReference(u16),

    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    #[error("nesting too deep")]
    NestingTooDeep,
}

/// RTMP handshake errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("unsupported RTMP version {0}")]
    InvalidVersion(u8),

    #[error("handshake timed out")]
    Timeout,
}

/// RTMP chunk stream errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u32),

    #[error("chunk stream {0} continues a message that was never started")]
    MissingHeader(u32),

    #[error("message of {size} bytes exceeds limit {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("chunk stream {csid} shrank its message to {length} bytes after {received} were received")]
    LengthMismatch {
        csid: u32,
        length: usize,
        received: usize,
    },
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wraps_and_root_unwraps() {
        let err = Error::Parse("bad".into()).at("read offer").at("whip");
        assert_eq!(err.to_string(), "whip: read offer: parse error: bad");
        assert!(matches!(err.root(), Error::Parse(_)));
    }

    #[test]
    fn test_result_ext_stage() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        ));
        let err = result.stage("read handshake 1").unwrap_err();
        assert!(err.to_string().starts_with("read handshake 1: IO error"));
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_sub_errors_convert() {
        let err: Error = AmfError::UnknownMarker(0x42).into();
        assert_eq!(err.to_string(), "AMF error: unknown type marker 0x42");

        let err: Error = ChunkError::MissingHeader(5).into();
        assert!(matches!(err, Error::Chunk(ChunkError::MissingHeader(5))));
    }
}
