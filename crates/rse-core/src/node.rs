//! The master node context: plugin, dispatcher and shared collaborators.

use std::sync::Arc;

use rse_transport::{EnvelopeReceiver, EnvelopeSender, TransportMetrics};
use tracing::{info, warn};

use crate::config::{ConfigError, RemoteSeConfig};
use crate::dispatch::Dispatcher;
use crate::errors::ReaderError;
use crate::plugin::RemoteSePlugin;
use crate::session::SessionFactory;

/// Everything the master side needs, built once and shared by `Arc`.
///
/// Hand [`MasterNode::receiver`] to the transport as its ingress and use
/// [`MasterNode::plugin`] to reach virtual readers.
pub struct MasterNode {
    config: RemoteSeConfig,
    sessions: Arc<SessionFactory>,
    plugin: Arc<RemoteSePlugin>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<TransportMetrics>,
}

impl MasterNode {
    pub fn new(
        config: RemoteSeConfig,
        sender: Arc<dyn EnvelopeSender>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        if sender.node_id() != config.node_id {
            warn!(
                configured = %config.node_id,
                transport = sender.node_id(),
                "transport node id differs from configured node id"
            );
        }

        let metrics = Arc::new(TransportMetrics::new("rse_master"));
        let sessions = Arc::new(SessionFactory::new());
        let plugin = Arc::new(
            RemoteSePlugin::new(
                config.plugin_name.as_str(),
                Arc::clone(&sender),
                Arc::clone(&sessions),
                config.rpc_timeout(),
            )
            .with_max_pending(config.max_pending_calls)
            .with_metrics(Arc::clone(&metrics)),
        );
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::clone(&plugin), sender).with_metrics(Arc::clone(&metrics)),
        );

        info!(node = %config.node_id, plugin = %config.plugin_name, "master node ready");
        Ok(Arc::new(Self {
            config,
            sessions,
            plugin,
            dispatcher,
            metrics,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &RemoteSeConfig {
        &self.config
    }

    pub fn plugin(&self) -> &Arc<RemoteSePlugin> {
        &self.plugin
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Ingress to register with the transport
    pub fn receiver(&self) -> Arc<dyn EnvelopeReceiver> {
        self.dispatcher.clone()
    }

    pub fn sessions(&self) -> &Arc<SessionFactory> {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Start presence polling on `reader_name` at the configured interval
    pub fn start_presence_monitor(&self, reader_name: &str) -> Result<bool, ReaderError> {
        let reader = self.plugin.get_reader(reader_name)?;
        Ok(reader.start_presence_monitor(self.config.monitor_poll_interval()))
    }

    /// Call timings and traffic in Prometheus text format
    pub fn export_metrics(&self) -> String {
        self.metrics.export_prometheus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rse_transport::MockSender;

    #[test]
    fn test_node_wires_config_through() {
        let config = RemoteSeConfig {
            plugin_name: "MasterPlugin".into(),
            rpc_timeout_ms: 750,
            ..Default::default()
        };
        let node = MasterNode::new(config, Arc::new(MockSender::new("master"))).unwrap();

        assert_eq!(node.node_id(), "master");
        assert_eq!(node.plugin().name(), "MasterPlugin");
        assert_eq!(node.plugin().rpc_timeout().as_millis(), 750);
        assert!(node.export_metrics().contains("rse_master_envelopes_received_total 0"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = RemoteSeConfig {
            rpc_timeout_ms: 0,
            ..Default::default()
        };
        assert!(MasterNode::new(config, Arc::new(MockSender::new("master"))).is_err());
    }

    #[tokio::test]
    async fn test_presence_monitor_needs_known_reader() {
        let node = MasterNode::new(
            RemoteSeConfig::default(),
            Arc::new(MockSender::new("master")),
        )
        .unwrap();
        assert!(node.start_presence_monitor("remote-R1-S1").unwrap_err().is_not_found());
    }
}
