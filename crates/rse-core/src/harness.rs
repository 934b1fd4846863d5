//! Test harness: a simulated slave node and a master/slave pair on a loopback hub.
//!
//! The slave answers card operations from a scripted card model, so master
//! behaviour can be exercised end to end without hardware or a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rse_transport::{
    Envelope, EnvelopeReceiver, EnvelopeSender, LoopbackHub, RemoteException, Route,
};
use tracing::{debug, warn};

use crate::card::{
    ApduResponse, CardRequest, CardResponse, ReaderEvent, ReaderEventType, SelectionStatus,
    TransmissionMode,
};
use crate::config::RemoteSeConfig;
use crate::node::MasterNode;
use crate::remote_method::{ConnectRequest, ConnectResponse, DefaultSelectionRequest, RemoteMethod};
use crate::rpc::RemoteMethodTxEngine;

const NATIVE_PLUGIN_NAME: &str = "SimulatedPlugin";

/// Card sitting in a simulated reader
#[derive(Clone, Debug)]
pub struct SimulatedCard {
    pub atr: Vec<u8>,
    pub aid: Vec<u8>,
}

impl SimulatedCard {
    pub fn new(atr: impl Into<Vec<u8>>, aid: impl Into<Vec<u8>>) -> Self {
        Self {
            atr: atr.into(),
            aid: aid.into(),
        }
    }

    /// A request matches when it selects nothing or selects this card's AID
    fn matches(&self, request: &CardRequest) -> bool {
        match request.selector.as_ref().and_then(|s| s.aid.as_ref()) {
            Some(aid) => *aid == self.aid,
            None => true,
        }
    }

    fn process(&self, request: &CardRequest) -> Option<CardResponse> {
        if !self.matches(request) {
            return None;
        }
        let apdu_responses = request
            .apdu_requests
            .iter()
            .map(|_| ApduResponse::new(vec![0x90, 0x00], true))
            .collect();
        Some(CardResponse {
            logical_channel_open: true,
            channel_previously_open: false,
            selection_status: request.selector.as_ref().map(|_| SelectionStatus {
                atr: Some(self.atr.clone()),
                fci: Some(self.aid.clone()),
                has_matched: true,
            }),
            apdu_responses,
        })
    }
}

#[derive(Default)]
struct NativeReader {
    session_id: Option<String>,
    card: Option<SimulatedCard>,
    default_selection: Option<DefaultSelectionRequest>,
}

/// Slave node hosting simulated native readers.
pub struct SimulatedSlave {
    master_node_id: String,
    sender: Arc<dyn EnvelopeSender>,
    /// Engine for slave-initiated calls (connect, disconnect)
    engine: RemoteMethodTxEngine,
    readers: DashMap<String, NativeReader>,
    reply_delay: Mutex<Duration>,
    silent: AtomicBool,
    seen_actions: Mutex<Vec<String>>,
}

impl SimulatedSlave {
    pub fn new(sender: Arc<dyn EnvelopeSender>, master_node_id: &str) -> Arc<Self> {
        Arc::new(Self {
            master_node_id: master_node_id.to_string(),
            engine: RemoteMethodTxEngine::new(Arc::clone(&sender), Duration::from_secs(5)),
            sender,
            readers: DashMap::new(),
            reply_delay: Mutex::new(Duration::ZERO),
            silent: AtomicBool::new(false),
            seen_actions: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        self.sender.node_id()
    }

    /// Delay every reply by `delay`
    pub fn set_reply_delay(&self, delay: Duration) {
        *self.reply_delay.lock() = delay;
    }

    /// Stop answering requests altogether
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }

    /// Actions of every request received so far
    pub fn seen_actions(&self) -> Vec<String> {
        self.seen_actions.lock().clone()
    }

    pub fn session_id(&self, native_reader_name: &str) -> Option<String> {
        self.readers
            .get(native_reader_name)
            .and_then(|r| r.session_id.clone())
    }

    pub fn default_selection(&self, native_reader_name: &str) -> Option<DefaultSelectionRequest> {
        self.readers
            .get(native_reader_name)
            .and_then(|r| r.default_selection.clone())
    }

    fn route(&self, native_reader_name: &str) -> Route {
        let route = Route::new(native_reader_name, "", self.node_id(), self.master_node_id.as_str());
        match self.session_id(native_reader_name) {
            Some(session_id) => route.with_session(session_id),
            None => route,
        }
    }

    /// Announce a native reader to the master; returns the session id
    pub async fn connect_reader(
        &self,
        native_reader_name: &str,
        transmission_mode: TransmissionMode,
    ) -> anyhow::Result<String> {
        self.readers
            .entry(native_reader_name.to_string())
            .or_default();
        let body = serde_json::to_string(&ConnectRequest {
            transmission_mode,
            options: HashMap::new(),
        })?;
        let reply = self
            .engine
            .call(
                RemoteMethod::ReaderConnect.as_str(),
                body,
                self.route(native_reader_name),
            )
            .await
            .with_context(|| format!("connecting {}", native_reader_name))?;
        let response: ConnectResponse = serde_json::from_str(&reply)?;

        if let Some(mut reader) = self.readers.get_mut(native_reader_name) {
            reader.session_id = Some(response.session_id.clone());
        }
        Ok(response.session_id)
    }

    pub async fn disconnect_reader(&self, native_reader_name: &str) -> anyhow::Result<()> {
        self.engine
            .call(
                RemoteMethod::ReaderDisconnect.as_str(),
                String::new(),
                self.route(native_reader_name),
            )
            .await
            .with_context(|| format!("disconnecting {}", native_reader_name))?;
        self.readers.remove(native_reader_name);
        Ok(())
    }

    /// Put a card in a reader and notify the master
    pub async fn insert_card(
        &self,
        native_reader_name: &str,
        card: SimulatedCard,
    ) -> anyhow::Result<()> {
        let default_responses = {
            let mut reader = self
                .readers
                .get_mut(native_reader_name)
                .with_context(|| format!("unknown native reader {}", native_reader_name))?;
            let responses = reader.default_selection.as_ref().map(|selection| {
                selection
                    .selection_requests
                    .iter()
                    .map(|r| card.process(r))
                    .collect::<Vec<_>>()
            });
            reader.card = Some(card);
            responses
        };

        let mut event = ReaderEvent::new(
            NATIVE_PLUGIN_NAME,
            native_reader_name,
            ReaderEventType::SeInserted,
        );
        event.default_selection_responses = default_responses;
        self.send_event(native_reader_name, &event).await
    }

    pub async fn remove_card(&self, native_reader_name: &str) -> anyhow::Result<()> {
        self.readers
            .get_mut(native_reader_name)
            .with_context(|| format!("unknown native reader {}", native_reader_name))?
            .card = None;
        let event = ReaderEvent::new(
            NATIVE_PLUGIN_NAME,
            native_reader_name,
            ReaderEventType::SeRemoved,
        );
        self.send_event(native_reader_name, &event).await
    }

    async fn send_event(&self, native_reader_name: &str, event: &ReaderEvent) -> anyhow::Result<()> {
        let body = serde_json::to_string(event)?;
        let envelope = Envelope::notification(
            RemoteMethod::ReaderEvent.as_str(),
            body,
            self.route(native_reader_name),
        );
        self.sender
            .send(&envelope, &self.master_node_id)
            .await
            .context("sending reader event")?;
        Ok(())
    }

    /// Build the reply to one master request
    fn answer(&self, request: &Envelope) -> Envelope {
        let native = request.native_reader_name();
        let method = match request.action().parse::<RemoteMethod>() {
            Ok(method) => method,
            Err(e) => return request.reply_exception(&RemoteException::new("UnsupportedAction", e.to_string())),
        };

        let mut reader = match self.readers.get_mut(native) {
            Some(reader) => reader,
            None => {
                return request.reply_exception(&RemoteException::new(
                    "ReaderNotFound",
                    format!("no native reader {}", native),
                ))
            }
        };

        let body = match method {
            RemoteMethod::TransmitSet => serde_json::from_str::<Vec<CardRequest>>(request.body())
                .and_then(|requests| {
                    let responses: Vec<Option<CardResponse>> = requests
                        .iter()
                        .map(|r| reader.card.as_ref().and_then(|card| card.process(r)))
                        .collect();
                    serde_json::to_string(&responses)
                }),
            RemoteMethod::ReaderTransmit => serde_json::from_str::<CardRequest>(request.body())
                .and_then(|r| {
                    serde_json::to_string(&reader.card.as_ref().and_then(|card| card.process(&r)))
                }),
            RemoteMethod::IsSePresent => serde_json::to_string(&reader.card.is_some()),
            RemoteMethod::DefaultSelectionRequest => {
                serde_json::from_str::<DefaultSelectionRequest>(request.body()).map(|selection| {
                    reader.default_selection = Some(selection);
                    String::new()
                })
            }
            other => {
                return request.reply_exception(&RemoteException::new(
                    "UnsupportedAction",
                    format!("{} is not served by a slave", other),
                ))
            }
        };

        match body {
            Ok(body) => request.reply(body),
            Err(e) => request.reply_exception(&RemoteException::from_error("Serialization", &e)),
        }
    }
}

#[async_trait]
impl EnvelopeReceiver for SimulatedSlave {
    async fn on_envelope_received(&self, envelope: Envelope) {
        if !envelope.is_request() {
            self.engine.on_response_received(envelope);
            return;
        }

        self.seen_actions.lock().push(envelope.action().to_string());
        if self.silent.load(Ordering::Relaxed) {
            debug!(action = envelope.action(), "silent slave ignoring request");
            return;
        }
        if envelope.is_notification() {
            return;
        }

        let reply = self.answer(&envelope);
        let target = envelope.requester_node_id().to_string();
        let delay = *self.reply_delay.lock();
        let sender = Arc::clone(&self.sender);

        // Replies go out from their own task so a slow answer never blocks ingress
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = sender.send(&reply, &target).await {
                warn!(action = reply.action(), "simulated slave failed to reply: {}", e);
            }
        });
    }
}

/// A master and one simulated slave wired through a [`LoopbackHub`]
pub struct LoopbackPair {
    pub hub: Arc<LoopbackHub>,
    pub master: Arc<MasterNode>,
    pub slave: Arc<SimulatedSlave>,
}

/// Build a master from `config` and a slave named `slave_node_id`, both attached to a fresh hub.
///
/// Must be called from within a tokio runtime.
pub fn loopback_pair(config: RemoteSeConfig, slave_node_id: &str) -> anyhow::Result<LoopbackPair> {
    let hub = LoopbackHub::new();
    let master_id = config.node_id.clone();

    let master = MasterNode::new(config, Arc::new(hub.sender(&master_id)))?;
    hub.attach(&master_id, master.receiver());

    let slave = SimulatedSlave::new(Arc::new(hub.sender(slave_node_id)), &master_id);
    hub.attach(slave_node_id, slave.clone());

    Ok(LoopbackPair { hub, master, slave })
}
