//! In-memory transports for testing master and slave nodes without a network.

use crate::envelope::Envelope;
use crate::metrics::TransportMetrics;
use crate::traits::{EnvelopeReceiver, EnvelopeSender, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Mock sender that records every envelope handed to it
pub struct MockSender {
    node_id: String,
    sent: Mutex<Vec<(/* target */ String, Envelope)>>,
    notify: Notify,
    connected: AtomicBool,
    latency: Duration,
    packet_loss: f64,
}

impl MockSender {
    /// Create a new mock sender for the local node `node_id`
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            sent: Mutex::new(Vec::new()),
            notify: Notify::new(),
            connected: AtomicBool::new(true),
            latency: Duration::ZERO,
            packet_loss: 0.0,
        }
    }

    /// Configure simulated latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Configure simulated loss (0.0 - 1.0)
    pub fn with_packet_loss(mut self, loss: f64) -> Self {
        self.packet_loss = loss.clamp(0.0, 1.0);
        self
    }

    /// Get sent envelopes with their target node
    pub fn get_sent(&self) -> Vec<(String, Envelope)> {
        self.sent.lock().clone()
    }

    /// Clear sent envelopes
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Simulate disconnect
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Simulate connect
    pub fn connect(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    /// Wait until at least `count` envelopes were sent, then return them all
    pub async fn wait_for_sent(&self, count: usize) -> Vec<(String, Envelope)> {
        loop {
            let notified = self.notify.notified();
            {
                let sent = self.sent.lock();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl EnvelopeSender for MockSender {
    async fn send(&self, envelope: &Envelope, target_node_id: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::Disconnected);
        }

        let should_drop = {
            let mut rng = rand::thread_rng();
            rng.gen::<f64>() < self.packet_loss
        };
        if should_drop {
            return Err(TransportError::Lost);
        }

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        self.sent
            .lock()
            .push((target_node_id.to_string(), envelope.clone()));
        self.notify.notify_waiters();
        Ok(())
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl Default for MockSender {
    fn default() -> Self {
        Self::new("mock-node")
    }
}

/// In-process network connecting any number of nodes by id.
///
/// Envelopes travel as JSON text, so every hop exercises the wire codec.
/// Each attached node gets one pump task that delivers its inbound traffic
/// sequentially, preserving send order per (sender, receiver) pair.
pub struct LoopbackHub {
    nodes: DashMap<String, mpsc::UnboundedSender<String>>,
    metrics: Arc<TransportMetrics>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Self::with_metrics(Arc::new(TransportMetrics::new("loopback")))
    }

    pub fn with_metrics(metrics: Arc<TransportMetrics>) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            metrics,
        })
    }

    /// Attach a receiver under `node_id`; replaces any previous attachment.
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, node_id: &str, receiver: Arc<dyn EnvelopeReceiver>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.nodes.insert(node_id.to_string(), tx);

        let metrics = Arc::clone(&self.metrics);
        let node = node_id.to_string();
        tokio::spawn(async move {
            while let Some(wire) = rx.recv().await {
                metrics.record_recv(wire.len());
                match Envelope::from_json(&wire) {
                    Ok(envelope) => receiver.on_envelope_received(envelope).await,
                    Err(e) => warn!(node = %node, "dropping malformed envelope: {}", e),
                }
            }
            debug!(node = %node, "loopback pump stopped");
        })
    }

    /// Detach a node; in-flight traffic to it is dropped
    pub fn detach(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Sender bound to the local node `node_id`
    pub fn sender(self: &Arc<Self>, node_id: &str) -> LoopbackSender {
        LoopbackSender {
            hub: Arc::clone(self),
            node_id: node_id.to_string(),
        }
    }

    /// Push raw wire text to a node, bypassing the encoder
    pub fn inject_raw(&self, node_id: &str, wire: &str) -> Result<(), TransportError> {
        self.deliver(node_id, wire.to_string())
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    fn deliver(&self, node_id: &str, wire: String) -> Result<(), TransportError> {
        let len = wire.len();
        let tx = self
            .nodes
            .get(node_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::UnknownNode(node_id.to_string()))?;
        tx.send(wire).map_err(|_| TransportError::Disconnected)?;
        self.metrics.record_send(len);
        Ok(())
    }
}

/// Sending half of one node attached to a [`LoopbackHub`]
#[derive(Clone)]
pub struct LoopbackSender {
    hub: Arc<LoopbackHub>,
    node_id: String,
}

#[async_trait]
impl EnvelopeSender for LoopbackSender {
    async fn send(&self, envelope: &Envelope, target_node_id: &str) -> Result<(), TransportError> {
        let wire = envelope.to_json()?;
        self.hub.deliver(target_node_id, wire).map_err(|e| {
            self.hub.metrics.record_send_failure();
            e
        })
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Route;

    struct Collector {
        seen: Mutex<Vec<Envelope>>,
        notify: Notify,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }

        async fn wait_for(&self, count: usize) -> Vec<Envelope> {
            loop {
                let notified = self.notify.notified();
                if self.seen.lock().len() >= count {
                    return self.seen.lock().clone();
                }
                notified.await;
            }
        }
    }

    #[async_trait]
    impl EnvelopeReceiver for Collector {
        async fn on_envelope_received(&self, envelope: Envelope) {
            self.seen.lock().push(envelope);
            self.notify.notify_waiters();
        }
    }

    fn note(body: &str) -> Envelope {
        Envelope::notification("readerEvent", body, Route::new("R1", "", "S1", "master"))
    }

    #[test]
    fn test_mock_sender() {
        tokio_test::block_on(async {
            let sender = MockSender::new("master");
            sender.send(&note("hello"), "S1").await.unwrap();

            let sent = sender.get_sent();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, "S1");
            assert_eq!(sent[0].1.body(), "hello");
            assert_eq!(sender.node_id(), "master");
        });
    }

    #[test]
    fn test_mock_sender_disconnected() {
        tokio_test::block_on(async {
            let sender = MockSender::new("master");
            sender.disconnect();
            assert!(matches!(
                sender.send(&note("x"), "S1").await,
                Err(TransportError::Disconnected)
            ));
            sender.connect();
            assert!(sender.send(&note("x"), "S1").await.is_ok());
        });
    }

    #[test]
    fn test_mock_sender_total_loss() {
        tokio_test::block_on(async {
            let sender = MockSender::new("master").with_packet_loss(1.0);
            assert!(matches!(
                sender.send(&note("x"), "S1").await,
                Err(TransportError::Lost)
            ));
            assert!(sender.get_sent().is_empty());
        });
    }

    #[tokio::test]
    async fn test_loopback_preserves_order() {
        let hub = LoopbackHub::new();
        let collector = Collector::new();
        hub.attach("master", collector.clone());

        let slave = hub.sender("S1");
        for i in 0..20 {
            slave.send(&note(&i.to_string()), "master").await.unwrap();
        }

        let seen = collector.wait_for(20).await;
        let bodies: Vec<_> = seen.iter().map(|e| e.body().to_string()).collect();
        let expected: Vec<_> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(bodies, expected);
        assert_eq!(hub.metrics().snapshot().envelopes_sent, 20);
    }

    #[tokio::test]
    async fn test_loopback_unknown_node() {
        let hub = LoopbackHub::new();
        let sender = hub.sender("S1");
        assert!(matches!(
            sender.send(&note("x"), "nobody").await,
            Err(TransportError::UnknownNode(_))
        ));
        assert_eq!(hub.metrics().snapshot().send_failures, 1);
    }

    #[tokio::test]
    async fn test_loopback_drops_malformed_wire() {
        let hub = LoopbackHub::new();
        let collector = Collector::new();
        hub.attach("master", collector.clone());

        hub.inject_raw("master", "{not json").unwrap();
        hub.sender("S1").send(&note("ok"), "master").await.unwrap();

        let seen = collector.wait_for(1).await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].body(), "ok");
    }
}
