//! Background card presence polling for one virtual reader.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::card::{ReaderEvent, ReaderEventType};
use crate::virtual_reader::{ProxyReader, VirtualReader};

/// Polls `isSePresent` and emits `SeInserted` / `SeRemoved` on transitions.
///
/// A removal is only reported after the card was seen present. The task
/// exits on [`PresenceMonitor::stop`], on drop, or once the reader is gone.
pub struct PresenceMonitor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PresenceMonitor {
    pub fn spawn(reader: Weak<VirtualReader>, interval: Duration) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_present: Option<bool> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let Some(reader) = reader.upgrade() else {
                    break;
                };

                let present = match reader.is_card_present().await {
                    Ok(present) => present,
                    Err(e) => {
                        warn!(reader = %reader.name(), "presence poll failed: {}", e);
                        continue;
                    }
                };
                if *stop_rx.borrow() {
                    break;
                }

                let event_type = match (last_present, present) {
                    (Some(false) | None, true) => Some(ReaderEventType::SeInserted),
                    (Some(true), false) => Some(ReaderEventType::SeRemoved),
                    _ => None,
                };
                last_present = Some(present);

                if let Some(event_type) = event_type {
                    let event = ReaderEvent::new(reader.plugin_name(), reader.name(), event_type);
                    reader.on_remote_reader_event(&event);
                }
            }
            debug!("presence monitor exited");
        });

        Self { stop, handle }
    }

    /// Signal the task to exit after its current poll
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for PresenceMonitor {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::TransmissionMode;
    use crate::rpc::RemoteMethodTxEngine;
    use crate::session::SessionFactory;
    use rse_transport::MockSender;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_monitor_exits_when_reader_dropped() {
        let sender = Arc::new(MockSender::new("master"));
        let session = SessionFactory::new().create_session("R1", "S1", "master");
        let reader = Arc::new(VirtualReader::new(
            "RemoteSePlugin",
            session,
            RemoteMethodTxEngine::new(sender.clone(), Duration::from_millis(10)),
            TransmissionMode::Contacts,
            HashMap::new(),
        ));

        let monitor = PresenceMonitor::spawn(Arc::downgrade(&reader), Duration::from_millis(50));
        drop(reader);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_on_signal() {
        let sender = Arc::new(MockSender::new("master"));
        let session = SessionFactory::new().create_session("R1", "S1", "master");
        let reader = Arc::new(VirtualReader::new(
            "RemoteSePlugin",
            session,
            RemoteMethodTxEngine::new(sender.clone(), Duration::from_millis(10)),
            TransmissionMode::Contacts,
            HashMap::new(),
        ));

        let monitor = PresenceMonitor::spawn(Arc::downgrade(&reader), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(120)).await;
        monitor.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!monitor.is_running());

        // Unanswered polls timed out, and nothing is left pending
        assert!(!sender.get_sent().is_empty());
        assert_eq!(reader.engine().pending_count(), 0);
    }
}
