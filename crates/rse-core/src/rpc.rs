//! Request/response correlation over a fire-and-forget transport.
//!
//! Each call registers a oneshot channel under a fresh correlation id, sends
//! the request envelope, and waits for the matching response or the timeout.
//! Calls are independent: there is no queue and no head-of-line blocking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rse_transport::{Envelope, EnvelopeSender, RemoteException, Route, TransportMetrics};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::RpcError;

/// Default bound on outstanding calls per engine
pub const DEFAULT_MAX_PENDING: usize = 256;

/// One reserved slot of the pending-call budget, released on drop.
struct Slot<'a>(&'a AtomicUsize);

impl<'a> Slot<'a> {
    fn reserve(in_flight: &'a AtomicUsize, limit: usize) -> Option<Self> {
        in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Slot(in_flight))
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Removes the pending record when the call completes, times out or is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Envelope>>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Issues remote calls and resolves them from incoming responses.
pub struct RemoteMethodTxEngine {
    sender: Arc<dyn EnvelopeSender>,
    timeout: Duration,
    max_pending: usize,
    /// Calls holding a pending slot, bounded by `max_pending`
    in_flight: AtomicUsize,
    pending: DashMap<String, oneshot::Sender<Envelope>>,
    metrics: Option<Arc<TransportMetrics>>,
}

impl RemoteMethodTxEngine {
    pub fn new(sender: Arc<dyn EnvelopeSender>, timeout: Duration) -> Self {
        Self {
            sender,
            timeout,
            max_pending: DEFAULT_MAX_PENDING,
            in_flight: AtomicUsize::new(0),
            pending: DashMap::new(),
            metrics: None,
        }
    }

    /// Hard bound on outstanding calls; extra calls fail with [`RpcError::TooManyPending`]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Record round trips and timeouts into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Id of the local node, used as requester on outgoing calls
    pub fn node_id(&self) -> &str {
        self.sender.node_id()
    }

    pub fn sender(&self) -> &Arc<dyn EnvelopeSender> {
        &self.sender
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Call with the engine's default timeout
    pub async fn call(&self, action: &str, body: String, route: Route) -> Result<String, RpcError> {
        self.call_with_timeout(action, body, route, self.timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        action: &str,
        body: String,
        route: Route,
        timeout: Duration,
    ) -> Result<String, RpcError> {
        let id = Uuid::new_v4().to_string();
        self.call_with_id(action, body, route, id, timeout).await
    }

    /// Call under a caller-chosen correlation id.
    ///
    /// Fails with [`RpcError::DuplicateCorrelationId`] if `id` is still
    /// pending; the outstanding call is left untouched.
    pub async fn call_with_id(
        &self,
        action: &str,
        body: String,
        route: Route,
        id: String,
        timeout: Duration,
    ) -> Result<String, RpcError> {
        let _slot = match Slot::reserve(&self.in_flight, self.max_pending) {
            Some(slot) => slot,
            None => {
                warn!(action, limit = self.max_pending, "pending call table full");
                return Err(RpcError::TooManyPending(self.max_pending));
            }
        };

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!(action, id = %id, "correlation id already pending");
                return Err(RpcError::DuplicateCorrelationId(id));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        let envelope = Envelope::request(action, body, route, id.clone());
        let target = envelope.target_node_id().to_string();
        debug!(action, id = %id, target = %target, "issuing remote call");

        let started = Instant::now();
        self.sender.send(&envelope, &target).await.map_err(|e| {
            warn!(action, id = %id, "failed to send request: {}", e);
            RpcError::from(e)
        })?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_rtt(started.elapsed());
                }
                debug!(action, id = %id, "remote call resolved");
                if response.contains_exception() {
                    let exception = response.exception_body().unwrap_or_else(|| {
                        RemoteException::new("Unknown", response.body().to_string())
                    });
                    return Err(RpcError::Remote(exception));
                }
                Ok(response.body().to_string())
            }
            Ok(Err(_)) => Err(RpcError::Cancelled(id)),
            Err(_) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_timeout();
                }
                warn!(action, id = %id, ?timeout, "remote call timed out");
                Err(RpcError::Timeout {
                    action: action.to_string(),
                    id,
                    timeout,
                })
            }
        }
    }

    /// Resolve the pending call matching `response`.
    ///
    /// Returns false, and drops the envelope, when no call is waiting for it.
    pub fn on_response_received(&self, response: Envelope) -> bool {
        let id = match response.id() {
            Some(id) => id.to_string(),
            None => {
                warn!(action = response.action(), "response without correlation id dropped");
                return false;
            }
        };

        match self.pending.remove(&id) {
            Some((_, tx)) => {
                if tx.send(response).is_err() {
                    debug!(id = %id, "caller went away before its response arrived");
                }
                true
            }
            None => {
                warn!(id = %id, action = response.action(), "no pending call for response, dropping");
                false
            }
        }
    }
}
