//! Card-level data carried inside envelope bodies.
//!
//! These types only describe what travels between master and slave. Command
//! semantics (APDU building, selection logic) live on the slave side.

use serde::{Deserialize, Serialize};

/// Serde adapter writing byte vectors as lowercase hex strings
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ============================================================================
// Commands
// ============================================================================

/// One command APDU
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApduRequest {
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
    /// ISO 7816-4 case 4 command (data in, data out)
    #[serde(default)]
    pub case4: bool,
    /// Status words accepted as success besides 9000
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub successful_status_codes: Vec<u16>,
    /// Optional label, for logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ApduRequest {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            case4: false,
            successful_status_codes: Vec::new(),
            name: None,
        }
    }

    pub fn case4(mut self) -> Self {
        self.case4 = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// One response APDU
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApduResponse {
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
    pub successful: bool,
}

impl ApduResponse {
    pub fn new(bytes: impl Into<Vec<u8>>, successful: bool) -> Self {
        Self {
            bytes: bytes.into(),
            successful,
        }
    }

    /// Trailing SW1SW2, if the response is long enough to carry one
    pub fn status_word(&self) -> Option<u16> {
        let n = self.bytes.len();
        if n < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.bytes[n - 2], self.bytes[n - 1]]))
    }

    /// Response data without the status word
    pub fn data(&self) -> &[u8] {
        let n = self.bytes.len().saturating_sub(2);
        &self.bytes[..n]
    }
}

/// Criteria used by the slave to select a card application
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSelector {
    #[serde(default, with = "hex_bytes_opt", skip_serializing_if = "Option::is_none")]
    pub aid: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr_regex: Option<String>,
}

/// What to do with the logical channel once a request has been processed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    #[default]
    KeepOpen,
    CloseAfter,
}

/// A selection plus the APDUs to run on the selected application
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<CardSelector>,
    #[serde(default)]
    pub apdu_requests: Vec<ApduRequest>,
    #[serde(default)]
    pub channel_state: ChannelState,
}

impl CardRequest {
    pub fn new(selector: Option<CardSelector>, apdu_requests: Vec<ApduRequest>) -> Self {
        Self {
            selector,
            apdu_requests,
            channel_state: ChannelState::KeepOpen,
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionStatus {
    #[serde(default, with = "hex_bytes_opt", skip_serializing_if = "Option::is_none")]
    pub atr: Option<Vec<u8>>,
    #[serde(default, with = "hex_bytes_opt", skip_serializing_if = "Option::is_none")]
    pub fci: Option<Vec<u8>>,
    pub has_matched: bool,
}

/// Outcome of one [`CardRequest`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardResponse {
    pub logical_channel_open: bool,
    #[serde(default)]
    pub channel_previously_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_status: Option<SelectionStatus>,
    #[serde(default)]
    pub apdu_responses: Vec<ApduResponse>,
}

// ============================================================================
// Reader and plugin metadata
// ============================================================================

/// Physical interface the native reader talks to the card through
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransmissionMode {
    #[default]
    Contacts,
    Contactless,
}

/// When the slave should notify the outcome of a default selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationMode {
    #[default]
    Always,
    MatchedOnly,
}

// ============================================================================
// Events
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReaderEventType {
    SeInserted,
    SeMatched,
    SeRemoved,
    IoError,
}

/// Card presence change reported for one reader
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderEvent {
    pub plugin_name: String,
    pub reader_name: String,
    pub event_type: ReaderEventType,
    /// Responses to the default selection request, when one was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_selection_responses: Option<Vec<Option<CardResponse>>>,
}

impl ReaderEvent {
    pub fn new(
        plugin_name: impl Into<String>,
        reader_name: impl Into<String>,
        event_type: ReaderEventType,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            reader_name: reader_name.into(),
            event_type,
            default_selection_responses: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginEventType {
    ReaderConnected,
    ReaderDisconnected,
}

/// Reader set change published by a plugin
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEvent {
    pub plugin_name: String,
    pub reader_names: Vec<String>,
    pub event_type: PluginEventType,
}

impl PluginEvent {
    pub fn new(
        plugin_name: impl Into<String>,
        reader_name: impl Into<String>,
        event_type: PluginEventType,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            reader_names: vec![reader_name.into()],
            event_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apdu_bytes_are_hex_on_the_wire() {
        let req = ApduRequest::new(vec![0x00, 0xA4, 0x04, 0x00]).case4();
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"bytes":"00a40400","case4":true}"#);

        let back: ApduRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_bad_hex_is_rejected() {
        let res = serde_json::from_str::<ApduResponse>(r#"{"bytes":"zz","successful":true}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_status_word() {
        let resp = ApduResponse::new(vec![0x6F, 0x00, 0x90, 0x00], true);
        assert_eq!(resp.status_word(), Some(0x9000));
        assert_eq!(resp.data(), &[0x6F, 0x00]);
        assert_eq!(ApduResponse::new(vec![0x90], false).status_word(), None);
    }

    #[test]
    fn test_response_list_keeps_absent_positions() {
        let list = vec![Some(CardResponse::default()), None, Some(CardResponse::default())];
        let json = serde_json::to_string(&list).unwrap();
        let back: Vec<Option<CardResponse>> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 3);
        assert!(back[1].is_none());
    }

    #[test]
    fn test_event_type_names() {
        let event = ReaderEvent::new("RemoteSePlugin", "remote-R1-S1", ReaderEventType::SeInserted);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""eventType":"SE_INSERTED""#));

        let plugin = PluginEvent::new("RemoteSePlugin", "remote-R1-S1", PluginEventType::ReaderConnected);
        let json = serde_json::to_string(&plugin).unwrap();
        assert!(json.contains(r#""eventType":"READER_CONNECTED""#));
        assert!(json.contains(r#""readerNames":["remote-R1-S1"]"#));
    }
}
