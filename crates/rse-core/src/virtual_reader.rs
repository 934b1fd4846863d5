//! Master-side stand-in for a reader attached to a slave node.
//!
//! A [`VirtualReader`] turns card operations into remote calls on its own
//! [`RemoteMethodTxEngine`] and re-emits card events pushed by the slave to
//! local observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use rse_transport::Route;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::card::{CardRequest, CardResponse, NotificationMode, ReaderEvent, TransmissionMode};
use crate::errors::{ReaderError, RpcError};
use crate::monitor::PresenceMonitor;
use crate::observable::{Observable, Observer, ObserverList};
use crate::remote_method::{DefaultSelectionRequest, RemoteMethod};
use crate::rpc::RemoteMethodTxEngine;
use crate::session::VirtualReaderSession;

const NAME_PREFIX: &str = "remote-";

// ============================================================================
// Name derivation
// ============================================================================

fn escape_component(out: &mut String, component: &str) {
    for c in component.chars() {
        if c == '\\' || c == '-' {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Name the master exposes for `native_reader_name` on `slave_node_id`.
///
/// `remote-<native>-<slave>`, with `\` and `-` inside each component escaped
/// by a backslash so distinct pairs never collide.
pub fn virtual_reader_name(native_reader_name: &str, slave_node_id: &str) -> String {
    let mut name = String::with_capacity(
        NAME_PREFIX.len() + native_reader_name.len() + slave_node_id.len() + 1,
    );
    name.push_str(NAME_PREFIX);
    escape_component(&mut name, native_reader_name);
    name.push('-');
    escape_component(&mut name, slave_node_id);
    name
}

/// Inverse of [`virtual_reader_name`]
pub fn parse_virtual_reader_name(name: &str) -> Option<(String, String)> {
    let rest = name.strip_prefix(NAME_PREFIX)?;
    let mut native = String::new();
    let mut slave = String::new();
    let mut in_slave = false;
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        let current = if in_slave { &mut slave } else { &mut native };
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('\\' | '-')) => current.push(escaped),
                _ => return None,
            },
            '-' if !in_slave => in_slave = true,
            '-' => return None,
            other => current.push(other),
        }
    }
    in_slave.then_some((native, slave))
}

// ============================================================================
// Reader contract
// ============================================================================

/// Card operations a reader offers to the application.
#[async_trait]
pub trait ProxyReader: Send + Sync {
    fn name(&self) -> &str;

    fn transmission_mode(&self) -> TransmissionMode;

    /// Process a batch of card requests.
    ///
    /// The result has one slot per request; `None` marks a request that
    /// produced no response.
    async fn transmit(
        &self,
        requests: Vec<CardRequest>,
    ) -> Result<Vec<Option<CardResponse>>, ReaderError>;

    async fn transmit_one(&self, request: CardRequest) -> Result<Option<CardResponse>, ReaderError>;

    async fn is_card_present(&self) -> Result<bool, ReaderError>;

    fn parameters(&self) -> HashMap<String, String>;

    fn set_parameter(&self, key: &str, value: &str);
}

// ============================================================================
// Virtual reader
// ============================================================================

pub struct VirtualReader {
    name: String,
    plugin_name: String,
    session: VirtualReaderSession,
    engine: RemoteMethodTxEngine,
    transmission_mode: TransmissionMode,
    options: HashMap<String, String>,
    parameters: RwLock<HashMap<String, String>>,
    default_selection: Mutex<Option<DefaultSelectionRequest>>,
    observers: ObserverList<ReaderEvent>,
    /// Serializes event delivery so observers see events in arrival order
    event_lock: ReentrantMutex<()>,
    monitor: Mutex<Option<PresenceMonitor>>,
    /// Set once the reader has left its plugin
    closed: AtomicBool,
}

impl VirtualReader {
    pub fn new(
        plugin_name: impl Into<String>,
        session: VirtualReaderSession,
        engine: RemoteMethodTxEngine,
        transmission_mode: TransmissionMode,
        options: HashMap<String, String>,
    ) -> Self {
        Self {
            name: virtual_reader_name(session.native_reader_name(), session.slave_node_id()),
            plugin_name: plugin_name.into(),
            session,
            engine,
            transmission_mode,
            options,
            parameters: RwLock::new(HashMap::new()),
            default_selection: Mutex::new(None),
            observers: ObserverList::new(),
            event_lock: ReentrantMutex::new(()),
            monitor: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &VirtualReaderSession {
        &self.session
    }

    pub fn native_reader_name(&self) -> &str {
        self.session.native_reader_name()
    }

    pub fn slave_node_id(&self) -> &str {
        self.session.slave_node_id()
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Connection options supplied by the slave
    pub fn options(&self) -> &HashMap<String, String> {
        &self.options
    }

    pub fn engine(&self) -> &RemoteMethodTxEngine {
        &self.engine
    }

    fn route(&self) -> Route {
        Route::new(
            self.session.native_reader_name(),
            self.name.as_str(),
            self.engine.node_id(),
            self.session.slave_node_id(),
        )
        .with_session(self.session.session_id())
    }

    fn communication(&self, source: RpcError) -> ReaderError {
        ReaderError::Communication {
            reader: self.name.clone(),
            source,
        }
    }

    async fn remote<T: DeserializeOwned>(
        &self,
        method: RemoteMethod,
        body: String,
    ) -> Result<T, ReaderError> {
        let reply = self
            .engine
            .call(method.as_str(), body, self.route())
            .await
            .map_err(|e| self.communication(e))?;
        Ok(serde_json::from_str(&reply)?)
    }

    /// Deliver a card event pushed by the slave to every local observer
    pub fn on_remote_reader_event(&self, event: &ReaderEvent) {
        let _ordered = self.event_lock.lock();
        debug!(reader = %self.name, event = ?event.event_type, "dispatching reader event");
        let failures = self.observers.notify(&self.name, event);
        if failures > 0 {
            warn!(reader = %self.name, failures, "some reader observers failed");
        }
    }

    /// Ask the slave to run `requests` on every card insertion
    pub async fn set_default_selection_request(
        &self,
        requests: Vec<CardRequest>,
        notification_mode: NotificationMode,
    ) -> Result<(), ReaderError> {
        let selection = DefaultSelectionRequest {
            selection_requests: requests,
            notification_mode,
        };
        let body = serde_json::to_string(&selection)?;
        self.engine
            .call(RemoteMethod::DefaultSelectionRequest.as_str(), body, self.route())
            .await
            .map_err(|e| self.communication(e))?;
        *self.default_selection.lock() = Some(selection);
        Ok(())
    }

    pub fn default_selection_request(&self) -> Option<DefaultSelectionRequest> {
        self.default_selection.lock().clone()
    }

    /// Start polling card presence every `interval`.
    ///
    /// The monitor runs as a tokio task, so this needs a runtime context.
    /// Returns false when a monitor is already running, the reader has been
    /// removed from its plugin, or no runtime is available.
    pub fn start_presence_monitor(self: &Arc<Self>, interval: Duration) -> bool {
        let mut monitor = self.monitor.lock();
        if self.is_closed() {
            warn!(reader = %self.name, "reader removed, presence monitor not started");
            return false;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(reader = %self.name, "no tokio runtime, presence monitor not started");
            return false;
        }
        if monitor.as_ref().is_some_and(|m| m.is_running()) {
            return false;
        }
        *monitor = Some(PresenceMonitor::spawn(Arc::downgrade(self), interval));
        info!(reader = %self.name, ?interval, "presence monitor started");
        true
    }

    /// Stop the presence monitor; false if none was running
    pub fn stop_presence_monitor(&self) -> bool {
        match self.monitor.lock().take() {
            Some(monitor) => {
                monitor.stop();
                info!(reader = %self.name, "presence monitor stopped");
                true
            }
            None => false,
        }
    }

    /// Mark the reader as torn down and stop its presence monitor
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop_presence_monitor();
    }

    /// True once the reader has been removed from its plugin
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().as_ref().is_some_and(|m| m.is_running())
    }
}

#[async_trait]
impl ProxyReader for VirtualReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn transmission_mode(&self) -> TransmissionMode {
        self.transmission_mode
    }

    async fn transmit(
        &self,
        requests: Vec<CardRequest>,
    ) -> Result<Vec<Option<CardResponse>>, ReaderError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::to_string(&requests)?;
        let mut responses: Vec<Option<CardResponse>> =
            self.remote(RemoteMethod::TransmitSet, body).await?;

        if responses.len() > requests.len() {
            return Err(ReaderError::UnexpectedResponse {
                reader: self.name.clone(),
                detail: format!(
                    "{} responses for {} requests",
                    responses.len(),
                    requests.len()
                ),
            });
        }
        // Requests the slave did not reach have no response
        responses.resize(requests.len(), None);
        Ok(responses)
    }

    async fn transmit_one(&self, request: CardRequest) -> Result<Option<CardResponse>, ReaderError> {
        let body = serde_json::to_string(&request)?;
        self.remote(RemoteMethod::ReaderTransmit, body).await
    }

    async fn is_card_present(&self) -> Result<bool, ReaderError> {
        self.remote(RemoteMethod::IsSePresent, String::new()).await
    }

    fn parameters(&self) -> HashMap<String, String> {
        self.parameters.read().clone()
    }

    fn set_parameter(&self, key: &str, value: &str) {
        self.parameters
            .write()
            .insert(key.to_string(), value.to_string());
    }
}

impl Observable<ReaderEvent> for VirtualReader {
    fn add_observer(&self, observer: Arc<dyn Observer<ReaderEvent>>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, observer: &Arc<dyn Observer<ReaderEvent>>) -> bool {
        self.observers.remove(observer)
    }

    fn clear_observers(&self) {
        self.observers.clear();
    }

    fn count_observers(&self) -> usize {
        self.observers.len()
    }

    fn notify_observers(&self, event: &ReaderEvent) {
        self.on_remote_reader_event(event);
    }
}

impl std::fmt::Debug for VirtualReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualReader")
            .field("name", &self.name)
            .field("session", &self.session)
            .field("transmission_mode", &self.transmission_mode)
            .finish()
    }
}
