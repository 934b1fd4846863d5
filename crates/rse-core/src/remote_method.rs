//! Names of the remote operations and the bodies they carry.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::card::{CardRequest, NotificationMode, TransmissionMode};

/// Action names exchanged in the envelope `action` field
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemoteMethod {
    /// Slave announces a native reader (handshake, answered with a session id)
    ReaderConnect,
    /// Slave withdraws a native reader
    ReaderDisconnect,
    /// Single card request
    ReaderTransmit,
    /// Batch of card requests
    TransmitSet,
    IsSePresent,
    /// Card event notification from the slave
    ReaderEvent,
    DefaultSelectionRequest,
    PluginEvent,
}

impl RemoteMethod {
    pub const ALL: [RemoteMethod; 8] = [
        RemoteMethod::ReaderConnect,
        RemoteMethod::ReaderDisconnect,
        RemoteMethod::ReaderTransmit,
        RemoteMethod::TransmitSet,
        RemoteMethod::IsSePresent,
        RemoteMethod::ReaderEvent,
        RemoteMethod::DefaultSelectionRequest,
        RemoteMethod::PluginEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteMethod::ReaderConnect => "readerConnect",
            RemoteMethod::ReaderDisconnect => "readerDisconnect",
            RemoteMethod::ReaderTransmit => "readerTransmit",
            RemoteMethod::TransmitSet => "transmitSet",
            RemoteMethod::IsSePresent => "isSePresent",
            RemoteMethod::ReaderEvent => "readerEvent",
            RemoteMethod::DefaultSelectionRequest => "defaultSelectionRequest",
            RemoteMethod::PluginEvent => "pluginEvent",
        }
    }
}

impl fmt::Display for RemoteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown remote method: {0}")]
pub struct UnknownMethod(pub String);

impl FromStr for RemoteMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RemoteMethod::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

// ============================================================================
// Bodies
// ============================================================================

/// Body of a `readerConnect` request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default)]
    pub transmission_mode: TransmissionMode,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// Body of a `readerConnect` response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub session_id: String,
}

/// Body of a `defaultSelectionRequest` call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultSelectionRequest {
    pub selection_requests: Vec<CardRequest>,
    pub notification_mode: NotificationMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names_round_trip() {
        for method in RemoteMethod::ALL {
            assert_eq!(method.as_str().parse::<RemoteMethod>().unwrap(), method);
            assert_eq!(method.to_string(), method.as_str());
        }
        assert!("transmit".parse::<RemoteMethod>().is_err());
    }

    #[test]
    fn test_connect_request_defaults() {
        let req: ConnectRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.transmission_mode, TransmissionMode::Contacts);
        assert!(req.options.is_empty());
    }
}
