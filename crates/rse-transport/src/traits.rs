//! Transport boundaries consumed and exposed by the RPC layer.

use async_trait::async_trait;

use crate::envelope::{Envelope, EnvelopeError};

/// Outbound half of a transport: deliver one envelope to one named node.
///
/// Fire-and-forget from the caller's point of view; delivery guarantees
/// belong to the implementation.
#[async_trait]
pub trait EnvelopeSender: Send + Sync {
    /// Send envelope to the node identified by `target_node_id`
    async fn send(&self, envelope: &Envelope, target_node_id: &str) -> Result<(), TransportError>;

    /// Logical id of the local node
    fn node_id(&self) -> &str;
}

/// Inbound half of a transport: the single ingress point it feeds.
#[async_trait]
pub trait EnvelopeReceiver: Send + Sync {
    /// Handle one envelope. Must not fail the receive path.
    async fn on_envelope_received(&self, envelope: Envelope);
}

/// Common transport error type
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Envelope lost in transit")]
    Lost,

    #[error("Codec error: {0}")]
    Codec(#[from] EnvelopeError),
}
