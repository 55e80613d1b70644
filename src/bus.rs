use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// A subscriber sink: the bounded channel a transport drains toward one
/// connected client.
#[derive(Clone)]
struct Sink {
    client_id: u64,
    tx: mpsc::Sender<Value>,
}

struct BusInner {
    /// uri -> sinks subscribed to that resource.
    subs: Mutex<HashMap<String, Vec<Sink>>>,
    /// Every notification also fans out here for SSE listeners.
    broadcast: broadcast::Sender<Value>,
    next_client: AtomicU64,
}

/// Maps resource URIs to subscriber sinks and fans out
/// `notifications/resources/updated` events.
///
/// Delivery is best-effort: a sink whose bounded queue is full is dropped
/// on the spot, so one slow client never stalls the dispatcher.
#[derive(Clone)]
pub struct SubscriptionBus {
    inner: Arc<BusInner>,
}

impl SubscriptionBus {
    pub fn new(broadcast_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(broadcast_capacity.max(16));
        Self {
            inner: Arc::new(BusInner {
                subs: Mutex::new(HashMap::new()),
                broadcast: tx,
                next_client: AtomicU64::new(1),
            }),
        }
    }

    /// Allocate an identity for a newly connected client.
    pub fn register_client(&self) -> u64 {
        self.inner.next_client.fetch_add(1, Ordering::SeqCst)
    }

    pub fn subscribe(&self, uri: &str, client_id: u64, tx: mpsc::Sender<Value>) {
        let mut subs = self.inner.subs.lock().expect("bus mutex poisoned");
        let sinks = subs.entry(uri.to_string()).or_default();
        // Re-subscribing replaces the previous sink for this client.
        sinks.retain(|s| s.client_id != client_id);
        sinks.push(Sink { client_id, tx });
        debug!(uri, client_id, "resource subscription added");
    }

    pub fn unsubscribe(&self, uri: &str, client_id: u64) {
        let mut subs = self.inner.subs.lock().expect("bus mutex poisoned");
        if let Some(sinks) = subs.get_mut(uri) {
            sinks.retain(|s| s.client_id != client_id);
            if sinks.is_empty() {
                subs.remove(uri);
            }
        }
    }

    /// Remove every subscription held by a disconnected client.
    pub fn drop_client(&self, client_id: u64) {
        let mut subs = self.inner.subs.lock().expect("bus mutex poisoned");
        subs.retain(|_, sinks| {
            sinks.retain(|s| s.client_id != client_id);
            !sinks.is_empty()
        });
    }

    pub fn subscription_count(&self) -> usize {
        let subs = self.inner.subs.lock().expect("bus mutex poisoned");
        subs.values().map(|v| v.len()).sum()
    }

    /// New receiver on the global notification stream (SSE transport).
    pub fn broadcast_receiver(&self) -> broadcast::Receiver<Value> {
        self.inner.broadcast.subscribe()
    }

    /// Publish a `notifications/resources/updated` event for one URI.
    pub fn publish_resource_updated(&self, uri: &str) {
        self.publish("notifications/resources/updated", json!({ "uri": uri }));

        let dead: Vec<u64> = {
            let subs = self.inner.subs.lock().expect("bus mutex poisoned");
            let Some(sinks) = subs.get(uri) else {
                return;
            };
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "notifications/resources/updated",
                "params": { "uri": uri }
            });
            sinks
                .iter()
                .filter(|sink| sink.tx.try_send(notification.clone()).is_err())
                .map(|sink| sink.client_id)
                .collect()
        };

        for client_id in dead {
            warn!(uri, client_id, "dropping slow or closed subscriber");
            self.unsubscribe(uri, client_id);
        }
    }

    /// Publish an arbitrary `notifications/*` event to the broadcast
    /// stream.
    pub fn publish(&self, method: &str, params: Value) {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        // Send fails only when no SSE listener exists; that's fine.
        let _ = self.inner.broadcast.send(message);
    }
}
