//! Server error types.

use netconf_core::CapabilityError;
use netconf_protocol::{ProtocolError, RpcError};
use thiserror::Error;

/// Errors that end a session or stop the server.
///
/// Anything that can be reported to the peer as an `<rpc-error>` travels as
/// [`RpcError`] instead and never becomes a `ServerError`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("peer did not advertise a compatible base capability")]
    NoBaseCapability,

    #[error("no free session id")]
    SessionIdsExhausted,

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("session closed")]
    SessionClosed,

    #[error("server shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ServerError {
    /// Returns whether the error was caused by the peer going away rather
    /// than by something it sent.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ServerError::Io(_) | ServerError::SessionClosed | ServerError::ShuttingDown => true,
            ServerError::Protocol(e) => !e.is_malformed(),
            _ => false,
        }
    }
}

/// Failure of an operation handler or datastore call.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Reported to the peer as an `<rpc-error>`; the session continues.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Not a protocol error; the session is terminated.
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal(message.into())
    }
}

impl From<HandlerError> for ServerError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Rpc(e) => ServerError::Handler(e.to_string()),
            HandlerError::Fatal(msg) => ServerError::Handler(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netconf_protocol::ErrorTag;

    #[test]
    fn test_disconnect_classification() {
        let io = ServerError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_disconnect());
        assert!(!ServerError::NoBaseCapability.is_disconnect());

        let malformed = ServerError::from(ProtocolError::Malformed("bad chunk".into()));
        assert!(!malformed.is_disconnect());
    }

    #[test]
    fn test_handler_error_from_rpc_error() {
        let err: HandlerError = RpcError::invalid_value("nope").into();
        match err {
            HandlerError::Rpc(e) => assert_eq!(e.tag, ErrorTag::InvalidValue),
            other => panic!("unexpected {:?}", other),
        }

        let fatal: ServerError = HandlerError::fatal("datastore crashed").into();
        assert_eq!(fatal.to_string(), "handler failed: datastore crashed");
    }
}
