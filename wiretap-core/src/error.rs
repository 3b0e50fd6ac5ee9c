use std::error::Error;
use std::fmt;
use std::io;

/// Connection-level errors, one variant per failure policy.
#[derive(Debug)]
pub enum ProxyError {
    /// The peer delivered fewer bytes than a frame or message needs.
    /// Retried until the deadline, then surfaced.
    ShortRead,
    /// A read or write deadline elapsed.
    DeadlineExceeded,
    /// The peer sent bytes that do not parse; carries a hex preview of the
    /// offending input for the log.
    ProtocolViolation(String),
    /// The TLS terminator could not complete the handshake.
    TlsHandshakeFailed(String),
    /// Replay found no mock for the live request.
    NoMatch,
    /// Another task consumed the chosen mock first. Retried internally,
    /// never surfaced to the client.
    MockStoreRace,
    /// Parent cancellation; clean shutdown, not user-visible.
    Canceled,
    Io(io::Error),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::ShortRead => write!(f, "short read from peer"),
            ProxyError::DeadlineExceeded => write!(f, "read deadline exceeded"),
            ProxyError::ProtocolViolation(ctx) => write!(f, "protocol violation: {}", ctx),
            ProxyError::TlsHandshakeFailed(ctx) => write!(f, "TLS handshake failed: {}", ctx),
            ProxyError::NoMatch => write!(f, "no matching mock"),
            ProxyError::MockStoreRace => write!(f, "mock store CAS lost"),
            ProxyError::Canceled => write!(f, "canceled"),
            ProxyError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl Error for ProxyError {}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProxyError::ShortRead
        } else {
            ProxyError::Io(err)
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::DeadlineExceeded
    }
}

impl ProxyError {
    /// Whether this is expected client/peer behavior rather than a proxy
    /// fault. Controls the log level at the connection boundary.
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            ProxyError::ShortRead
                | ProxyError::DeadlineExceeded
                | ProxyError::ProtocolViolation(_)
                | ProxyError::TlsHandshakeFailed(_)
                | ProxyError::Canceled
        )
    }
}
