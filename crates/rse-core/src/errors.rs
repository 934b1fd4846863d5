//! Error types for the master side.
//!
//! Each concern has its own enum. Reader-level errors can be mapped to a
//! wire-safe [`RemoteException`] for transmission back to a slave node.

use std::time::Duration;

use rse_transport::{EnvelopeError, RemoteException, TransportError};
use thiserror::Error;

// ============================================================================
// RPC Errors
// ============================================================================

/// Failure of a single remote call. The engine stays usable afterwards.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No correlated response arrived in time
    #[error("no response to {action} (id {id}) within {timeout:?}")]
    Timeout {
        action: String,
        id: String,
        timeout: Duration,
    },

    /// The remote node answered with an error description
    #[error("remote error: {0}")]
    Remote(RemoteException),

    /// The request could not be handed to the transport
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A call with the same correlation id is still outstanding
    #[error("correlation id {0} is already pending")]
    DuplicateCorrelationId(String),

    /// Pending-call table is full
    #[error("too many pending calls (limit {0})")]
    TooManyPending(usize),

    /// The pending record vanished without a response
    #[error("call {0} cancelled before a response arrived")]
    Cancelled(String),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

// ============================================================================
// Reader Errors
// ============================================================================

/// Errors raised by virtual readers and the plugin registry.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// Remote call on behalf of a reader failed (timeout, remote error, transport)
    #[error("communication with reader {reader} failed: {source}")]
    Communication {
        reader: String,
        #[source]
        source: RpcError,
    },

    #[error("virtual reader already exists for {native_reader_name} on {slave_node_id}")]
    DuplicateReader {
        native_reader_name: String,
        slave_node_id: String,
    },

    #[error("reader not found: {0}")]
    ReaderNotFound(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The remote answered with a well-formed body of the wrong shape
    #[error("unexpected response from {reader}: {detail}")]
    UnexpectedResponse { reader: String, detail: String },
}

impl ReaderError {
    /// Stable kind tag used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            ReaderError::Communication { .. } => "ReaderCommunication",
            ReaderError::DuplicateReader { .. } => "DuplicateReader",
            ReaderError::ReaderNotFound(_) => "ReaderNotFound",
            ReaderError::Serialization(_) => "Serialization",
            ReaderError::UnexpectedResponse { .. } => "UnexpectedResponse",
        }
    }

    /// Convert to a wire-safe error description
    pub fn to_remote_exception(&self) -> RemoteException {
        RemoteException::from_error(self.kind(), self)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReaderError::ReaderNotFound(_))
    }
}

// ============================================================================
// Dispatch Errors
// ============================================================================

/// Errors specific to ingress dispatch. None of them stop the receive path.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("decode error: {0}")]
    Decode(#[from] EnvelopeError),

    #[error("no handler for action {0:?}")]
    NoHandler(String),

    /// Response without a correlation id
    #[error("response without correlation id")]
    MissingCorrelationId,

    /// Response whose id matches no pending call
    #[error("no pending call for correlation id {0}")]
    UnknownCorrelation(String),

    #[error("handler error: {0}")]
    Handler(#[from] ReaderError),

    /// The reply to a slave request could not be sent
    #[error("reply failed: {0}")]
    Reply(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_error_maps_to_remote_exception() {
        let err = ReaderError::Communication {
            reader: "remote-R1-S1".into(),
            source: RpcError::TooManyPending(4),
        };
        let exc = err.to_remote_exception();
        assert_eq!(exc.kind, "ReaderCommunication");
        assert!(exc.message.contains("remote-R1-S1"));
        assert_eq!(exc.stack_trace, vec!["too many pending calls (limit 4)".to_string()]);
    }

    #[test]
    fn test_timeout_predicate() {
        let err = RpcError::Timeout {
            action: "transmitSet".into(),
            id: "1".into(),
            timeout: Duration::from_millis(10),
        };
        assert!(err.is_timeout());
        assert!(!RpcError::Cancelled("1".into()).is_timeout());
    }

    #[test]
    fn test_error_messages() {
        let err = ReaderError::DuplicateReader {
            native_reader_name: "R1".into(),
            slave_node_id: "S1".into(),
        };
        assert_eq!(err.to_string(), "virtual reader already exists for R1 on S1");
        assert!(ReaderError::ReaderNotFound("x".into()).is_not_found());
    }
}
