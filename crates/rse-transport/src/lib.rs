//! Wire envelope and transport abstractions for remote secure element readers.
//!
//! This crate defines the message unit exchanged between master and slave nodes,
//! its JSON codec, and the two boundaries a network layer has to satisfy: an
//! [`EnvelopeSender`] that delivers one envelope to one named node, and an
//! [`EnvelopeReceiver`] ingress the transport feeds. Concrete transports
//! (long-polling HTTP, websockets, ...) plug in behind these traits.

pub mod envelope;
pub mod traits;
pub mod metrics;
pub mod testing;

pub use envelope::*;
pub use traits::*;
pub use metrics::*;
pub use testing::*;
