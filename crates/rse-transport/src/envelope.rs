//! The envelope exchanged between master and slave nodes, and its JSON codec.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key that marks a serialized body as carrying a remote error description.
pub const EXCEPTION_MARKER: &str = "stackTrace";

/// Envelope codec error
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope is missing required field: {0}")]
    MissingField(&'static str),
}

/// Routing metadata shared by every envelope built for one exchange.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Route {
    /// Session id, `None` before the connect handshake completed
    pub session_id: Option<String>,
    pub native_reader_name: String,
    pub virtual_reader_name: String,
    pub requester_node_id: String,
    pub target_node_id: String,
}

impl Route {
    /// Route with no session, used for pre-session handshakes
    pub fn new(
        native_reader_name: impl Into<String>,
        virtual_reader_name: impl Into<String>,
        requester_node_id: impl Into<String>,
        target_node_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: None,
            native_reader_name: native_reader_name.into(),
            virtual_reader_name: virtual_reader_name.into(),
            requester_node_id: requester_node_id.into(),
            target_node_id: target_node_id.into(),
        }
    }

    /// Attach a session id
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Wire unit carrying an action, an opaque body and correlation metadata.
///
/// Envelopes are immutable once built. `id` and `session_id` distinguish
/// "absent" from "empty string" and both survive a JSON round trip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    action: String,
    #[serde(default)]
    body: String,
    is_request: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default)]
    native_reader_name: String,
    #[serde(default)]
    virtual_reader_name: String,
    #[serde(default)]
    requester_node_id: String,
    #[serde(default)]
    target_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

impl Envelope {
    fn build(
        action: impl Into<String>,
        body: impl Into<String>,
        is_request: bool,
        route: Route,
        id: Option<String>,
    ) -> Self {
        Self {
            action: action.into(),
            body: body.into(),
            is_request,
            session_id: route.session_id,
            native_reader_name: route.native_reader_name,
            virtual_reader_name: route.virtual_reader_name,
            requester_node_id: route.requester_node_id,
            target_node_id: route.target_node_id,
            id,
        }
    }

    /// Build a request expecting a correlated response
    pub fn request(
        action: impl Into<String>,
        body: impl Into<String>,
        route: Route,
        id: impl Into<String>,
    ) -> Self {
        Self::build(action, body, true, route, Some(id.into()))
    }

    /// Build a response to the request carrying `id`
    pub fn response(
        action: impl Into<String>,
        body: impl Into<String>,
        route: Route,
        id: impl Into<String>,
    ) -> Self {
        Self::build(action, body, false, route, Some(id.into()))
    }

    /// Build a fire-and-forget notification (no correlation id)
    pub fn notification(action: impl Into<String>, body: impl Into<String>, route: Route) -> Self {
        Self::build(action, body, true, route, None)
    }

    /// Build a response whose body describes a failure
    pub fn exception(
        action: impl Into<String>,
        exception: &RemoteException,
        route: Route,
        id: Option<String>,
    ) -> Self {
        Self::build(action, exception.to_body(), false, route, id)
    }

    /// Build the empty acknowledgement: every field blank except `id`
    pub fn no_response(id: Option<String>) -> Self {
        Self::build("", "", false, Route::default().with_session(""), id)
    }

    /// Response to this envelope, routed back to its requester
    pub fn reply(&self, body: impl Into<String>) -> Self {
        Self::build(
            self.action.clone(),
            body,
            false,
            self.reverse_route(),
            self.id.clone(),
        )
    }

    /// Exception response to this envelope, routed back to its requester
    pub fn reply_exception(&self, exception: &RemoteException) -> Self {
        Self::exception(self.action.clone(), exception, self.reverse_route(), self.id.clone())
    }

    fn reverse_route(&self) -> Route {
        Route {
            session_id: self.session_id.clone(),
            native_reader_name: self.native_reader_name.clone(),
            virtual_reader_name: self.virtual_reader_name.clone(),
            requester_node_id: self.target_node_id.clone(),
            target_node_id: self.requester_node_id.clone(),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is_request(&self) -> bool {
        self.is_request
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn native_reader_name(&self) -> &str {
        &self.native_reader_name
    }

    pub fn virtual_reader_name(&self) -> &str {
        &self.virtual_reader_name
    }

    pub fn requester_node_id(&self) -> &str {
        &self.requester_node_id
    }

    pub fn target_node_id(&self) -> &str {
        &self.target_node_id
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// A request without correlation id; no reply is expected
    pub fn is_notification(&self) -> bool {
        self.is_request && self.id.is_none()
    }

    /// True for the blank "no-op" acknowledgement
    pub fn is_empty_response(&self) -> bool {
        self.action.is_empty()
    }

    /// True when the body is a serialized [`RemoteException`]
    pub fn contains_exception(&self) -> bool {
        match serde_json::from_str::<serde_json::Value>(&self.body) {
            Ok(serde_json::Value::Object(map)) => map.contains_key(EXCEPTION_MARKER),
            _ => false,
        }
    }

    /// Decode the remote error carried by this envelope, if any
    pub fn exception_body(&self) -> Option<RemoteException> {
        if !self.contains_exception() {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }

    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the JSON wire form
    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if value.get("action").is_none() {
            return Err(EnvelopeError::MissingField("action"));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Serializable description of an error raised on the remote node.
///
/// `stack_trace` holds the chain of causes, outermost first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteException {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

impl RemoteException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack_trace: Vec::new(),
        }
    }

    /// Capture an error and its source chain
    pub fn from_error(kind: impl Into<String>, error: &(dyn StdError + 'static)) -> Self {
        let mut stack_trace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            stack_trace.push(cause.to_string());
            source = cause.source();
        }
        Self {
            kind: kind.into(),
            message: error.to_string(),
            stack_trace,
        }
    }

    fn to_body(&self) -> String {
        // A struct of strings always serializes
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"kind":"","message":"","{}":[]}}"#, EXCEPTION_MARKER)
        })
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for RemoteException {}
