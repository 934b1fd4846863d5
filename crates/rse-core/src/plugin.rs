//! Registry of virtual readers, one per (native reader, slave node) pair.
//!
//! The registry creates a reader on first contact from a slave, removes it
//! on disconnect, and publishes `READER_CONNECTED` / `READER_DISCONNECTED`
//! to its own observers once the registry change is visible.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rse_transport::{EnvelopeSender, TransportMetrics};
use tracing::{debug, info, warn};

use crate::card::{PluginEvent, PluginEventType, ReaderEvent, TransmissionMode};
use crate::errors::ReaderError;
use crate::observable::{Observable, Observer, ObserverList};
use crate::rpc::{RemoteMethodTxEngine, DEFAULT_MAX_PENDING};
use crate::session::SessionFactory;
use crate::virtual_reader::{virtual_reader_name, ProxyReader, VirtualReader};

pub const DEFAULT_PLUGIN_NAME: &str = "RemoteSePlugin";

pub struct RemoteSePlugin {
    name: String,
    sender: Arc<dyn EnvelopeSender>,
    sessions: Arc<SessionFactory>,
    rpc_timeout: Duration,
    max_pending: usize,
    metrics: Option<Arc<TransportMetrics>>,
    /// Keyed by virtual reader name
    readers: RwLock<BTreeMap<String, Arc<VirtualReader>>>,
    observers: ObserverList<PluginEvent>,
    parameters: RwLock<HashMap<String, String>>,
}

impl RemoteSePlugin {
    pub fn new(
        name: impl Into<String>,
        sender: Arc<dyn EnvelopeSender>,
        sessions: Arc<SessionFactory>,
        rpc_timeout: Duration,
    ) -> Self {
        let name = name.into();
        info!(plugin = %name, ?rpc_timeout, "remote SE plugin initialized");
        Self {
            name,
            sender,
            sessions,
            rpc_timeout,
            max_pending: DEFAULT_MAX_PENDING,
            metrics: None,
            readers: RwLock::new(BTreeMap::new()),
            observers: ObserverList::new(),
            parameters: RwLock::new(HashMap::new()),
        }
    }

    /// Pending-call bound given to each reader's engine
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    fn new_engine(&self) -> RemoteMethodTxEngine {
        let engine = RemoteMethodTxEngine::new(Arc::clone(&self.sender), self.rpc_timeout)
            .with_max_pending(self.max_pending);
        match &self.metrics {
            Some(metrics) => engine.with_metrics(Arc::clone(metrics)),
            None => engine,
        }
    }

    /// Register a virtual reader for `native_reader_name` on `slave_node_id`.
    ///
    /// Fails with [`ReaderError::DuplicateReader`] if the pair is already
    /// registered; the registry is unchanged in that case.
    pub fn create_virtual_reader(
        &self,
        slave_node_id: &str,
        native_reader_name: &str,
        transmission_mode: TransmissionMode,
        options: HashMap<String, String>,
    ) -> Result<Arc<VirtualReader>, ReaderError> {
        let name = virtual_reader_name(native_reader_name, slave_node_id);
        let reader = {
            let mut readers = self.readers.write();
            if readers.contains_key(&name) {
                warn!(reader = native_reader_name, slave = slave_node_id, "virtual reader already exists");
                return Err(ReaderError::DuplicateReader {
                    native_reader_name: native_reader_name.to_string(),
                    slave_node_id: slave_node_id.to_string(),
                });
            }

            let session =
                self.sessions
                    .create_session(native_reader_name, slave_node_id, self.sender.node_id());
            let reader = Arc::new(VirtualReader::new(
                self.name.as_str(),
                session,
                self.new_engine(),
                transmission_mode,
                options,
            ));
            readers.insert(name.clone(), Arc::clone(&reader));
            reader
        };

        info!(
            reader = %name,
            session = reader.session().session_id(),
            ?transmission_mode,
            "virtual reader connected"
        );
        self.notify_observers(&PluginEvent::new(
            self.name.as_str(),
            name,
            PluginEventType::ReaderConnected,
        ));
        Ok(reader)
    }

    /// Tear down and unregister a virtual reader.
    ///
    /// The reader is closed, which stops its presence monitor for good, and
    /// its observers are cleared before it leaves the registry.
    pub fn remove_virtual_reader(
        &self,
        native_reader_name: &str,
        slave_node_id: &str,
    ) -> Result<Arc<VirtualReader>, ReaderError> {
        let name = virtual_reader_name(native_reader_name, slave_node_id);
        let reader = {
            let mut readers = self.readers.write();
            let reader = readers
                .get(&name)
                .cloned()
                .ok_or_else(|| ReaderError::ReaderNotFound(name.clone()))?;
            reader.close();
            reader.clear_observers();
            readers.remove(&name);
            reader
        };

        info!(reader = %name, slave = slave_node_id, "virtual reader disconnected");
        self.notify_observers(&PluginEvent::new(
            self.name.as_str(),
            name,
            PluginEventType::ReaderDisconnected,
        ));
        Ok(reader)
    }

    /// Disconnect initiated by the master application
    pub fn disconnect_virtual_reader(
        &self,
        native_reader_name: &str,
        slave_node_id: &str,
    ) -> Result<(), ReaderError> {
        debug!(reader = native_reader_name, slave = slave_node_id, "master-initiated disconnect");
        self.remove_virtual_reader(native_reader_name, slave_node_id)
            .map(|_| ())
    }

    /// Forward a card event to the reader named in `event.reader_name`
    pub fn on_reader_event(&self, event: &ReaderEvent) -> Result<(), ReaderError> {
        let reader = self.get_reader(&event.reader_name).map_err(|e| {
            warn!(reader = %event.reader_name, "reader event for unknown reader");
            e
        })?;
        reader.on_remote_reader_event(event);
        Ok(())
    }

    /// Publish a plugin event reported by a slave, already renamed to virtual reader names
    pub fn on_plugin_event(&self, event: &PluginEvent) {
        debug!(plugin = %self.name, event = ?event.event_type, "remote plugin event");
        self.notify_observers(event);
    }

    pub fn get_reader(&self, name: &str) -> Result<Arc<VirtualReader>, ReaderError> {
        self.readers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ReaderError::ReaderNotFound(name.to_string()))
    }

    pub fn get_reader_by_remote_name(
        &self,
        native_reader_name: &str,
        slave_node_id: &str,
    ) -> Result<Arc<VirtualReader>, ReaderError> {
        self.get_reader(&virtual_reader_name(native_reader_name, slave_node_id))
    }

    /// Reader whose engine waits for correlation id `id`
    pub fn find_pending(&self, id: &str) -> Option<Arc<VirtualReader>> {
        self.readers
            .read()
            .values()
            .find(|r| r.engine().is_pending(id))
            .cloned()
    }

    /// Sorted reader names
    pub fn reader_names(&self) -> Vec<String> {
        self.readers.read().keys().cloned().collect()
    }

    /// Readers sorted by name
    pub fn readers(&self) -> Vec<Arc<VirtualReader>> {
        self.readers.read().values().cloned().collect()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.read().len()
    }

    pub fn parameters(&self) -> HashMap<String, String> {
        self.parameters.read().clone()
    }

    pub fn set_parameter(&self, key: &str, value: &str) {
        self.parameters
            .write()
            .insert(key.to_string(), value.to_string());
    }
}

impl Observable<PluginEvent> for RemoteSePlugin {
    fn add_observer(&self, observer: Arc<dyn Observer<PluginEvent>>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, observer: &Arc<dyn Observer<PluginEvent>>) -> bool {
        self.observers.remove(observer)
    }

    fn clear_observers(&self) {
        self.observers.clear();
    }

    fn count_observers(&self) -> usize {
        self.observers.len()
    }

    fn notify_observers(&self, event: &PluginEvent) {
        self.observers.notify(&self.name, event);
    }
}
