//! Ingress dispatch for envelopes arriving at the master node.
//!
//! Responses resolve pending calls on the owning reader's engine, reader and
//! plugin events go to the plugin registry, and connect/disconnect handshakes from
//! slaves create or remove virtual readers. Anything else is logged and
//! counted as unhandled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rse_transport::{
    Envelope, EnvelopeReceiver, EnvelopeSender, Route, TransportMetrics,
};
use tracing::{debug, warn};

use crate::card::{PluginEvent, ReaderEvent};
use crate::errors::{DispatchError, ReaderError};
use crate::plugin::RemoteSePlugin;
use crate::remote_method::{ConnectRequest, ConnectResponse, RemoteMethod};
use crate::virtual_reader::{virtual_reader_name, ProxyReader};

// ============================================================================
// Dispatch Statistics
// ============================================================================

/// Statistics for ingress dispatch.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Total envelopes received
    pub received: AtomicU64,
    /// Requests and notifications handled successfully
    pub dispatched: AtomicU64,
    /// Responses matched to a pending call
    pub responses_resolved: AtomicU64,
    /// Envelopes dropped for any reason
    pub dropped: AtomicU64,
    /// Envelopes with an action nobody handles
    pub unhandled: AtomicU64,
    /// Wire text that did not decode
    pub decode_failures: AtomicU64,
    /// Handlers that returned an error
    pub handler_errors: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            responses_resolved: self.responses_resolved.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.received.store(0, Ordering::Relaxed);
        self.dispatched.store(0, Ordering::Relaxed);
        self.responses_resolved.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.unhandled.store(0, Ordering::Relaxed);
        self.decode_failures.store(0, Ordering::Relaxed);
        self.handler_errors.store(0, Ordering::Relaxed);
    }

    fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_responses_resolved(&self) {
        self.responses_resolved.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_unhandled(&self) {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
        self.inc_dropped();
    }

    fn inc_decode_failures(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
        self.inc_dropped();
    }

    fn inc_handler_errors(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
        self.inc_dropped();
    }
}

/// Snapshot of dispatch statistics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub responses_resolved: u64,
    pub dropped: u64,
    pub unhandled: u64,
    pub decode_failures: u64,
    pub handler_errors: u64,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// What the dispatcher did with an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    ResponseResolved,
    EventDelivered,
    /// Virtual reader created, with its name
    ReaderConnected(String),
    ReaderDisconnected(String),
}

/// Single ingress point of the master node.
pub struct Dispatcher {
    plugin: Arc<RemoteSePlugin>,
    /// Used to answer slave-initiated handshakes
    sender: Arc<dyn EnvelopeSender>,
    stats: Arc<DispatchStats>,
    metrics: Option<Arc<TransportMetrics>>,
}

impl Dispatcher {
    pub fn new(plugin: Arc<RemoteSePlugin>, sender: Arc<dyn EnvelopeSender>) -> Self {
        Self {
            plugin,
            sender,
            stats: Arc::new(DispatchStats::new()),
            metrics: None,
        }
    }

    /// Count raw wire traffic seen by [`Dispatcher::dispatch_json`]
    pub fn with_metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    pub fn plugin(&self) -> &Arc<RemoteSePlugin> {
        &self.plugin
    }

    /// Route one envelope.
    ///
    /// Errors are local to this envelope; the dispatcher stays usable.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<DispatchOutcome, DispatchError> {
        self.stats.inc_received();

        if !envelope.is_request() {
            return self.resolve_response(envelope);
        }

        let method = match envelope.action().parse::<RemoteMethod>() {
            Ok(method) => method,
            Err(_) => return Err(self.unhandled(&envelope)),
        };

        let result = match method {
            RemoteMethod::ReaderEvent => self.handle_reader_event(&envelope),
            RemoteMethod::PluginEvent => self.handle_plugin_event(&envelope),
            RemoteMethod::ReaderConnect => self.handle_connect(&envelope).await,
            RemoteMethod::ReaderDisconnect => self.handle_disconnect(&envelope).await,
            _ => return Err(self.unhandled(&envelope)),
        };

        match &result {
            Ok(_) => self.stats.inc_dispatched(),
            Err(e) => {
                warn!(action = envelope.action(), "handler error: {}", e);
                self.stats.inc_handler_errors();
            }
        }
        result
    }

    /// Decode wire text, then dispatch
    pub async fn dispatch_json(&self, wire: &str) -> Result<DispatchOutcome, DispatchError> {
        if let Some(metrics) = &self.metrics {
            metrics.record_recv(wire.len());
        }
        let envelope = Envelope::from_json(wire).map_err(|e| {
            warn!("failed to decode envelope: {}", e);
            self.stats.inc_received();
            self.stats.inc_decode_failures();
            DispatchError::from(e)
        })?;
        self.dispatch(envelope).await
    }

    fn unhandled(&self, envelope: &Envelope) -> DispatchError {
        warn!(
            action = envelope.action(),
            from = envelope.requester_node_id(),
            "unhandled envelope"
        );
        self.stats.inc_unhandled();
        DispatchError::NoHandler(envelope.action().to_string())
    }

    fn resolve_response(&self, envelope: Envelope) -> Result<DispatchOutcome, DispatchError> {
        let id = match envelope.id() {
            Some(id) => id.to_string(),
            None => {
                warn!(action = envelope.action(), "response without correlation id dropped");
                self.stats.inc_dropped();
                return Err(DispatchError::MissingCorrelationId);
            }
        };

        // The named reader first, any reader waiting for this id otherwise
        let owner = self
            .plugin
            .get_reader(envelope.virtual_reader_name())
            .ok()
            .filter(|r| r.engine().is_pending(&id))
            .or_else(|| self.plugin.find_pending(&id));

        match owner {
            Some(reader) if reader.engine().on_response_received(envelope) => {
                self.stats.inc_responses_resolved();
                Ok(DispatchOutcome::ResponseResolved)
            }
            _ => {
                warn!(id = %id, "no pending call for response, dropping");
                self.stats.inc_dropped();
                Err(DispatchError::UnknownCorrelation(id))
            }
        }
    }

    fn handle_reader_event(&self, envelope: &Envelope) -> Result<DispatchOutcome, DispatchError> {
        let mut event: ReaderEvent =
            serde_json::from_str(envelope.body()).map_err(ReaderError::from)?;

        // Slaves report under the native name; observers see the virtual one
        let reader = self
            .plugin
            .get_reader_by_remote_name(envelope.native_reader_name(), envelope.requester_node_id())?;
        event.reader_name = reader.name().to_string();
        event.plugin_name = self.plugin.name().to_string();

        debug!(reader = %event.reader_name, event = ?event.event_type, "reader event received");
        self.plugin.on_reader_event(&event)?;
        Ok(DispatchOutcome::EventDelivered)
    }

    fn handle_plugin_event(&self, envelope: &Envelope) -> Result<DispatchOutcome, DispatchError> {
        let mut event: PluginEvent =
            serde_json::from_str(envelope.body()).map_err(ReaderError::from)?;

        let slave = envelope.requester_node_id();
        event.reader_names = event
            .reader_names
            .iter()
            .map(|native| virtual_reader_name(native, slave))
            .collect();
        event.plugin_name = self.plugin.name().to_string();

        debug!(slave = %slave, event = ?event.event_type, readers = ?event.reader_names, "plugin event received");
        self.plugin.on_plugin_event(&event);
        Ok(DispatchOutcome::EventDelivered)
    }

    async fn handle_connect(&self, envelope: &Envelope) -> Result<DispatchOutcome, DispatchError> {
        let slave = envelope.requester_node_id();
        let native = envelope.native_reader_name();

        let created = parse_connect_request(envelope.body()).and_then(|request| {
            self.plugin.create_virtual_reader(
                slave,
                native,
                request.transmission_mode,
                request.options,
            )
        });

        match created {
            Ok(reader) => {
                let body = serde_json::to_string(&ConnectResponse {
                    session_id: reader.session().session_id().to_string(),
                })
                .map_err(ReaderError::from)?;
                if let Some(id) = envelope.id() {
                    let route = Route::new(native, reader.name(), self.sender.node_id(), slave)
                        .with_session(reader.session().session_id());
                    let reply = Envelope::response(envelope.action(), body, route, id);
                    self.sender.send(&reply, slave).await?;
                }
                Ok(DispatchOutcome::ReaderConnected(reader.name().to_string()))
            }
            Err(e) => {
                self.reply_error(envelope, &e).await;
                Err(e.into())
            }
        }
    }

    async fn handle_disconnect(&self, envelope: &Envelope) -> Result<DispatchOutcome, DispatchError> {
        let slave = envelope.requester_node_id();
        match self
            .plugin
            .remove_virtual_reader(envelope.native_reader_name(), slave)
        {
            Ok(reader) => {
                if envelope.id().is_some() {
                    let ack = Envelope::no_response(envelope.id().map(str::to_string));
                    self.sender.send(&ack, slave).await?;
                }
                Ok(DispatchOutcome::ReaderDisconnected(reader.name().to_string()))
            }
            Err(e) => {
                self.reply_error(envelope, &e).await;
                Err(e.into())
            }
        }
    }

    /// Answer a failed slave request with an exception envelope
    async fn reply_error(&self, envelope: &Envelope, error: &ReaderError) {
        if envelope.id().is_none() {
            return;
        }
        let reply = envelope.reply_exception(&error.to_remote_exception());
        if let Err(e) = self.sender.send(&reply, envelope.requester_node_id()).await {
            warn!(action = envelope.action(), "failed to send error reply: {}", e);
        }
    }
}

fn parse_connect_request(body: &str) -> Result<ConnectRequest, ReaderError> {
    if body.trim().is_empty() {
        return Ok(ConnectRequest::default());
    }
    Ok(serde_json::from_str(body)?)
}

#[async_trait]
impl EnvelopeReceiver for Dispatcher {
    async fn on_envelope_received(&self, envelope: Envelope) {
        if let Err(e) = self.dispatch(envelope).await {
            debug!("envelope not dispatched: {}", e);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{PluginEventType, ReaderEventType, TransmissionMode};
    use crate::observable::Observable;
    use crate::plugin::DEFAULT_PLUGIN_NAME;
    use crate::session::SessionFactory;
    use parking_lot::Mutex;
    use rse_transport::MockSender;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        sender: Arc<MockSender>,
        plugin: Arc<RemoteSePlugin>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture() -> Fixture {
        let sender = Arc::new(MockSender::new("master"));
        let plugin = Arc::new(RemoteSePlugin::new(
            DEFAULT_PLUGIN_NAME,
            sender.clone(),
            Arc::new(SessionFactory::new()),
            Duration::from_millis(1000),
        ));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&plugin), sender.clone()));
        Fixture {
            sender,
            plugin,
            dispatcher,
        }
    }

    fn from_slave(action: &str, body: &str, id: Option<&str>) -> Envelope {
        let route = Route::new("R1", "", "S1", "master");
        match id {
            Some(id) => Envelope::request(action, body, route, id),
            None => Envelope::notification(action, body, route),
        }
    }

    #[tokio::test]
    async fn test_connect_handshake_creates_reader_and_replies() {
        let f = fixture();
        let body = r#"{"transmissionMode":"CONTACTLESS","options":{"isAsync":"true"}}"#;

        let outcome = f
            .dispatcher
            .dispatch(from_slave("readerConnect", body, Some("c-1")))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::ReaderConnected("remote-R1-S1".into()));

        let reader = f.plugin.get_reader_by_remote_name("R1", "S1").unwrap();
        assert_eq!(reader.transmission_mode(), TransmissionMode::Contactless);
        assert_eq!(reader.options().get("isAsync").map(String::as_str), Some("true"));

        let sent = f.sender.get_sent();
        let (target, reply) = &sent[0];
        assert_eq!(target, "S1");
        assert!(!reply.is_request());
        assert_eq!(reply.id(), Some("c-1"));
        assert_eq!(reply.virtual_reader_name(), "remote-R1-S1");
        let resp: ConnectResponse = serde_json::from_str(reply.body()).unwrap();
        assert_eq!(resp.session_id, reader.session().session_id());
        assert_eq!(reply.session_id(), Some(reader.session().session_id()));

        let stats = f.dispatcher.stats().snapshot();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.dispatched, 1);
    }

    #[tokio::test]
    async fn test_duplicate_connect_replies_with_exception() {
        let f = fixture();
        f.dispatcher
            .dispatch(from_slave("readerConnect", "", Some("c-1")))
            .await
            .unwrap();

        let err = f
            .dispatcher
            .dispatch(from_slave("readerConnect", "", Some("c-2")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Handler(ReaderError::DuplicateReader { .. })
        ));

        let sent = f.sender.get_sent();
        assert_eq!(sent.len(), 2);
        let exc = sent[1].1.exception_body().unwrap();
        assert_eq!(exc.kind, "DuplicateReader");
        assert_eq!(f.plugin.reader_count(), 1);
        assert_eq!(f.dispatcher.stats().snapshot().handler_errors, 1);
    }

    #[tokio::test]
    async fn test_disconnect_acks_with_no_response() {
        let f = fixture();
        f.dispatcher
            .dispatch(from_slave("readerConnect", "", Some("c-1")))
            .await
            .unwrap();
        let outcome = f
            .dispatcher
            .dispatch(from_slave("readerDisconnect", "", Some("d-1")))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::ReaderDisconnected("remote-R1-S1".into()));
        assert_eq!(f.plugin.reader_count(), 0);

        let ack = &f.sender.get_sent()[1].1;
        assert!(ack.is_empty_response());
        assert_eq!(ack.id(), Some("d-1"));

        // Disconnecting again is an error answered with an exception
        assert!(f
            .dispatcher
            .dispatch(from_slave("readerDisconnect", "", Some("d-2")))
            .await
            .is_err());
        assert!(f.sender.get_sent()[2].1.contains_exception());
    }

    #[tokio::test]
    async fn test_reader_event_is_renamed_and_delivered() {
        let f = fixture();
        let reader = f
            .plugin
            .create_virtual_reader("S1", "R1", TransmissionMode::Contacts, HashMap::new())
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            reader.add_observer(Arc::new(move |e: &ReaderEvent| -> anyhow::Result<()> {
                seen.lock().push((e.reader_name.clone(), e.event_type));
                Ok(())
            }));
        }

        let event = ReaderEvent::new("NativePlugin", "R1", ReaderEventType::SeInserted);
        let body = serde_json::to_string(&event).unwrap();
        let outcome = f
            .dispatcher
            .dispatch(from_slave("readerEvent", &body, None))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::EventDelivered);
        assert_eq!(
            *seen.lock(),
            vec![("remote-R1-S1".to_string(), ReaderEventType::SeInserted)]
        );
        // Notifications get no reply
        assert!(f.sender.get_sent().is_empty());
    }

    #[tokio::test]
    async fn test_plugin_event_is_renamed_and_published() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            f.plugin.add_observer(Arc::new(move |e: &PluginEvent| -> anyhow::Result<()> {
                seen.lock().push(e.clone());
                Ok(())
            }));
        }

        let mut event = PluginEvent::new("NativePlugin", "R1", PluginEventType::ReaderConnected);
        event.reader_names.push("R-2".into());
        let body = serde_json::to_string(&event).unwrap();
        let outcome = f
            .dispatcher
            .dispatch(from_slave("pluginEvent", &body, None))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::EventDelivered);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].plugin_name, DEFAULT_PLUGIN_NAME);
        assert_eq!(seen[0].event_type, PluginEventType::ReaderConnected);
        assert_eq!(
            seen[0].reader_names,
            vec!["remote-R1-S1".to_string(), "remote-R\\-2-S1".to_string()]
        );
        assert!(f.sender.get_sent().is_empty());
        assert_eq!(f.dispatcher.stats().snapshot().dispatched, 1);

        let err = f
            .dispatcher
            .dispatch(from_slave("pluginEvent", "{oops", None))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler(ReaderError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_event_for_unknown_reader_is_isolated() {
        let f = fixture();
        let body = serde_json::to_string(&ReaderEvent::new("p", "R1", ReaderEventType::SeRemoved)).unwrap();

        let err = f
            .dispatcher
            .dispatch(from_slave("readerEvent", &body, None))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler(ReaderError::ReaderNotFound(_))));

        let stats = f.dispatcher.stats().snapshot();
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_response_resolves_reader_call() {
        let f = fixture();
        let reader = f
            .plugin
            .create_virtual_reader("S1", "R1", TransmissionMode::Contacts, HashMap::new())
            .unwrap();

        let task = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.is_card_present().await })
        };
        let sent = f.sender.wait_for_sent(1).await;
        let outcome = f.dispatcher.dispatch(sent[0].1.reply("true")).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::ResponseResolved);
        assert!(task.await.unwrap().unwrap());
        assert_eq!(f.dispatcher.stats().snapshot().responses_resolved, 1);
    }

    #[tokio::test]
    async fn test_unknown_and_unhandled_envelopes_are_dropped() {
        let f = fixture();

        let stray = Envelope::response("transmitSet", "[]", Route::default(), "ghost");
        assert!(matches!(
            f.dispatcher.dispatch(stray).await,
            Err(DispatchError::UnknownCorrelation(_))
        ));

        assert!(matches!(
            f.dispatcher.dispatch(Envelope::no_response(None)).await,
            Err(DispatchError::MissingCorrelationId)
        ));

        assert!(matches!(
            f.dispatcher.dispatch(from_slave("transmitSet", "[]", Some("x"))).await,
            Err(DispatchError::NoHandler(_))
        ));
        assert!(matches!(
            f.dispatcher.dispatch(from_slave("selfDestruct", "", None)).await,
            Err(DispatchError::NoHandler(_))
        ));

        let stats = f.dispatcher.stats().snapshot();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.unhandled, 2);
        assert_eq!(stats.dropped, 4);
    }

    #[tokio::test]
    async fn test_dispatch_json_counts_decode_failures() {
        let f = fixture();
        let metrics = Arc::new(TransportMetrics::new("test"));
        let dispatcher = Dispatcher::new(Arc::clone(&f.plugin), f.sender.clone())
            .with_metrics(Arc::clone(&metrics));

        assert!(matches!(
            dispatcher.dispatch_json("{\"body\":\"\"}").await,
            Err(DispatchError::Decode(_))
        ));

        let wire = from_slave("readerConnect", "", Some("c-1")).to_json().unwrap();
        dispatcher.dispatch_json(&wire).await.unwrap();

        let stats = dispatcher.stats().snapshot();
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(metrics.snapshot().envelopes_received, 2);
    }

    #[tokio::test]
    async fn test_stats_reset() {
        let f = fixture();
        let _ = f.dispatcher.dispatch(Envelope::no_response(None)).await;
        assert_ne!(f.dispatcher.stats().snapshot(), DispatchStatsSnapshot::default());

        f.dispatcher.stats().reset();
        assert_eq!(f.dispatcher.stats().snapshot(), DispatchStatsSnapshot::default());
    }
}
