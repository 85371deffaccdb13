//! Observer fan-out: live WebSocket subscribers fed from the event bus.
//!
//! A single forwarder task subscribes to the bus, serializes each event
//! once, and hands the payload to every registered session. A session
//! whose channel is gone is dropped on the spot.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use oozer_core::events::EventBus;

/// The set of live subscriber sessions.
pub struct ObserverHub {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_id: AtomicU64,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a session's sender. Returns the session id used for
    /// [`Self::unregister`].
    pub fn register(&self, tx: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("observer mutex poisoned")
            .insert(id, tx);
        debug!(session = id, "observer session registered");
        id
    }

    pub fn unregister(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("observer mutex poisoned")
            .remove(&id);
        debug!(session = id, "observer session removed");
    }

    /// Send one serialized payload to every session, dropping any session
    /// whose channel has closed.
    pub fn broadcast(&self, payload: &str) {
        self.subscribers
            .lock()
            .expect("observer mutex poisoned")
            .retain(|_, tx| tx.send(payload.to_owned()).is_ok());
    }

    pub fn session_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("observer mutex poisoned")
            .len()
    }
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward bus events to the hub until cancelled.
///
/// Dropping the subscription stream on exit is what unsubscribes from the
/// underlying channel, including on abnormal termination.
pub async fn forward_bus_events(
    bus: Arc<dyn EventBus>,
    hub: Arc<ObserverHub>,
    cancel: CancellationToken,
) {
    let mut stream = match bus.subscribe().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "event bus subscription failed; observers get no events");
            return;
        }
    };

    info!("observer forwarder started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(payload) => hub.broadcast(&payload),
                    Err(e) => warn!(error = %e, "failed to serialize event for observers"),
                }
            }
        }
    }
    info!("observer forwarder stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use oozer_core::events::{Event, LocalBus};

    use super::*;

    #[test]
    fn broadcast_reaches_all_sessions() {
        let hub = ObserverHub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        hub.register(tx_a);
        hub.register(tx_b);

        hub.broadcast("payload");

        assert_eq!(rx_a.try_recv().unwrap(), "payload");
        assert_eq!(rx_b.try_recv().unwrap(), "payload");
    }

    #[test]
    fn dead_sessions_are_dropped_on_broadcast() {
        let hub = ObserverHub::new();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        hub.register(tx_live);
        hub.register(tx_dead);
        drop(rx_dead);

        hub.broadcast("x");

        assert_eq!(hub.session_count(), 1);
        assert_eq!(rx_live.try_recv().unwrap(), "x");
    }

    #[test]
    fn unregister_removes_session() {
        let hub = ObserverHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = hub.register(tx);
        assert_eq!(hub.session_count(), 1);

        hub.unregister(id);
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn forwarder_delivers_bus_events_and_stops_on_cancel() {
        let bus = Arc::new(LocalBus::new());
        let hub = Arc::new(ObserverHub::new());
        let cancel = CancellationToken::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(tx);

        let forwarder = tokio::spawn(forward_bus_events(
            bus.clone(),
            Arc::clone(&hub),
            cancel.clone(),
        ));

        // Give the forwarder a beat to subscribe before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish(&Event::PlanCreated { plan_id: 42 }).await;

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("payload should arrive")
            .expect("channel open");
        assert!(payload.contains("\"plan_created\""));
        assert!(payload.contains("42"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), forwarder)
            .await
            .expect("forwarder should stop on cancel")
            .unwrap();
    }
}
