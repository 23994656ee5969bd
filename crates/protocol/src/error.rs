//! Error types for the chat transport contract.

use thiserror::Error;

/// Transport error type covering all failure modes a bridge has to react to.
#[derive(Debug, Error)]
pub enum TransportError {
    // Connectivity errors
    /// A request or long-poll did not complete in time.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The connection could not be established or was reset.
    #[error("connection error: {0}")]
    Connection(String),

    /// The transport was closed for good (e.g. its input stream ended).
    #[error("transport closed: {0}")]
    Closed(String),

    // Server-side errors
    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote API returned an error response.
    #[error("api error (status {status}): {message}")]
    Api {
        /// HTTP-style status code.
        status: u16,
        /// Error message returned by the server.
        message: String,
    },

    /// A response could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    // Handler errors
    /// The event handler asked the loop to stop.
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
}

impl TransportError {
    /// Returns true for failures that are recovered by reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Connection(_))
    }

    /// Returns true when the transport ended deliberately.
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed(_))
    }
}

/// Error returned by an [`EventHandler`](crate::EventHandler) callback.
///
/// Handlers swallow per-event problems themselves; anything returned here
/// ends the listen loop.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// An unrecoverable failure in the component behind the handler.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Result type alias using [`TransportError`].
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout("sync".into()).is_transient());
        assert!(TransportError::Connection("reset".into()).is_transient());
        assert!(!TransportError::Auth("bad password".into()).is_transient());
        assert!(!TransportError::Closed("stdin".into()).is_transient());
        assert!(!TransportError::Api {
            status: 400,
            message: "M_BAD_JSON".into()
        }
        .is_transient());
    }

    #[test]
    fn test_closed_classification() {
        assert!(TransportError::Closed("eof".into()).is_closed());
        assert!(!TransportError::Timeout("eof".into()).is_closed());
    }

    #[test]
    fn test_handler_error_conversion() {
        let err: TransportError = HandlerError::Fatal("pty gone".into()).into();
        assert!(matches!(err, TransportError::Handler(_)));
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "handler failed: fatal: pty gone");
    }

    #[test]
    fn test_api_error_display() {
        let err = TransportError::Api {
            status: 404,
            message: "unknown room".into(),
        };
        assert_eq!(err.to_string(), "api error (status 404): unknown room");
    }
}
