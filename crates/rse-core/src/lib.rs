//! RSE Core - master side of the Remote SE protocol.
//!
//! This crate implements:
//! - Request/response correlation over a fire-and-forget transport
//! - Virtual readers proxying card operations to slave nodes
//! - The plugin registry owning virtual readers and their sessions
//! - Ingress dispatch of slave requests, responses and events
//! - Presence polling and observer notification
//! - Configuration and a loopback test harness

#![forbid(unsafe_code)]

// Protocol model
pub mod card;
pub mod remote_method;

// Call machinery
pub mod rpc;
pub mod dispatch;

// Readers and registry
pub mod session;
pub mod virtual_reader;
pub mod monitor;
pub mod plugin;
pub mod observable;

// Supporting modules
pub mod errors;
pub mod config;
pub mod node;
pub mod harness;

pub use card::*;
pub use config::{ConfigError, RemoteSeConfig};
pub use dispatch::{DispatchOutcome, DispatchStats, DispatchStatsSnapshot, Dispatcher};
pub use errors::{DispatchError, ReaderError, RpcError};
pub use node::MasterNode;
pub use observable::{Observable, Observer, ObserverList};
pub use plugin::{RemoteSePlugin, DEFAULT_PLUGIN_NAME};
pub use remote_method::{ConnectRequest, ConnectResponse, DefaultSelectionRequest, RemoteMethod};
pub use rpc::RemoteMethodTxEngine;
pub use session::{SessionFactory, VirtualReaderSession};
pub use virtual_reader::{parse_virtual_reader_name, virtual_reader_name, ProxyReader, VirtualReader};
