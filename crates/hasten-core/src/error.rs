//! Shared error type across hasten crates.

use thiserror::Error;

/// Error classes (stable API), used for logging and for deciding whether a
/// connection survives the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad handshake, magic mismatch, unknown codec.
    Protocol,
    /// Read/decode failure mid-stream.
    Framing,
    /// Unknown service/method or a handler error. Connection keeps serving.
    Application,
    /// Heartbeat lapsed or the registry has no live endpoint.
    Liveness,
    /// Socket level failure, closed connection, deadline.
    Transport,
    /// Invalid configuration or registration.
    Config,
    /// Internal server error.
    Internal,
}

impl ErrorKind {
    /// String representation used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Framing => "FRAMING",
            ErrorKind::Application => "APPLICATION",
            ErrorKind::Liveness => "LIVENESS",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Config => "CONFIG",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Unified error type used by core and runtime.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("deadline exceeded")]
    Timeout,
    #[error("{0}")]
    Remote(String),
    #[error("rpc server: invalid method format: {0}")]
    InvalidMethodName(String),
    #[error("rpc server: service {0} not found")]
    UnknownService(String),
    #[error("rpc server: method {method} not found in service {service}")]
    UnknownMethod { service: String, method: String },
    #[error("rpc server: {0} is not a valid service name")]
    InvalidServiceName(String),
    #[error("rpc server: service {0} already registered")]
    DuplicateService(String),
    #[error("service not found in registry: {0}")]
    ServiceNotFound(String),
    #[error("no addresses to balance over")]
    NoAddresses,
    #[error("config: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl RpcError {
    /// Map an error to its class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Protocol(_) | RpcError::UnsupportedCodec(_) => ErrorKind::Protocol,
            RpcError::Framing(_) | RpcError::FrameTooLarge { .. } => ErrorKind::Framing,
            RpcError::Io(_) | RpcError::ConnectionClosed | RpcError::Timeout => {
                ErrorKind::Transport
            }
            RpcError::Remote(_)
            | RpcError::InvalidMethodName(_)
            | RpcError::UnknownService(_)
            | RpcError::UnknownMethod { .. } => ErrorKind::Application,
            RpcError::ServiceNotFound(_) | RpcError::NoAddresses => ErrorKind::Liveness,
            RpcError::InvalidServiceName(_)
            | RpcError::DuplicateService(_)
            | RpcError::Config(_) => ErrorKind::Config,
            RpcError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the connection that produced this error is unusable afterwards.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Protocol | ErrorKind::Framing | ErrorKind::Transport
        )
    }

    /// Clean end-of-stream on a frame boundary. A peer dying mid-frame
    /// surfaces as `Io(UnexpectedEof)` and is not clean.
    pub fn is_eof(&self) -> bool {
        matches!(self, RpcError::ConnectionClosed)
    }
}

impl From<bincode::Error> for RpcError {
    fn from(e: bincode::Error) -> Self {
        RpcError::Framing(format!("bincode: {e}"))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Protocol(format!("json: {e}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn application_errors_keep_the_connection() {
        let e = RpcError::UnknownService("Nope".into());
        assert_eq!(e.kind(), ErrorKind::Application);
        assert!(!e.is_fatal());
    }

    #[test]
    fn framing_errors_are_fatal() {
        let e = RpcError::FrameTooLarge { size: 10, max: 1 };
        assert_eq!(e.kind().as_str(), "FRAMING");
        assert!(e.is_fatal());
    }

    #[test]
    fn only_a_clean_close_counts_as_eof() {
        assert!(RpcError::ConnectionClosed.is_eof());
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(!RpcError::Io(io).is_eof());
        assert!(!RpcError::Timeout.is_eof());
    }
}
