use crate::pg::message::ErrorResponse;

/// The tagged union of everything that can end a session or abort configuration.
///
/// Mirrors the kinds laid out in the error handling design: most variants carry
/// enough context to build the `FATAL` `ErrorResponse` sent back to the client
/// before the connection is torn down.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The upstream rejected authentication. The payload is forwarded to the
    /// client verbatim instead of being re-synthesized.
    #[error("authentication failed: {0}")]
    AuthFailed(ErrorResponse),

    /// GSS encryption or SASL authentication was requested; neither is implemented.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// The peer closed the connection. Not a failure — demoted to info by the
    /// manager's error collector and reported as a clean stop.
    #[error("connection closed")]
    ConnectionClosed,

    /// No bytes arrived within the idle deadline. Retryable up to a bounded
    /// count during steady-state relay; terminal everywhere else.
    #[error("idle timeout")]
    IdleTimeout,

    /// A configuration option failed validation at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// The credential interceptor refused the connection.
    #[error("interceptor error: {0}")]
    Interceptor(String),

    /// Dialing the upstream failed (TCP connect or TLS handshake).
    #[error("failed to connect to upstream: {0}")]
    UpstreamDial(#[source] std::io::Error),

    /// Any other I/O error not covered above.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True for errors that should be logged at info level rather than error
    /// level — currently only a clean peer disconnect.
    pub fn is_benign(&self) -> bool {
        matches!(self, ProxyError::ConnectionClosed)
    }

    /// Builds the `FATAL` `ErrorResponse` that must be sent to the client
    /// before the session is torn down. `AuthFailed` relays the upstream's own
    /// response verbatim; everything else is synthesized from the error text.
    pub fn to_client_error_response(&self) -> ErrorResponse {
        match self {
            ProxyError::AuthFailed(resp) => resp.clone(),
            other => ErrorResponse::fatal(other.to_string()),
        }
    }
}

/// Whether a `std::io::Error` (as surfaced from a read on the relay path)
/// represents a transient condition the relay should retry rather than treat
/// as terminal. Covers timeouts and "would block" style conditions, which is
/// the Rust analogue of Go's `net.Error.Timeout()`/`Temporary()`.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}
