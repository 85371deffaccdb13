//! In-process event bus on a `tokio::sync::broadcast` channel.
//!
//! Used for single-node runs without Redis and throughout the test suite.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{Event, EventBus};

#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<Event>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, event: &Event) {
        // A send error only means there is no subscriber right now.
        let _ = self.tx.send(event.clone());
    }

    async fn subscribe(&self) -> anyhow::Result<BoxStream<'static, Event>> {
        let rx = self.tx.subscribe();
        // Lagged receivers drop the missed events; the stream keeps going.
        let stream = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
        Ok(stream.boxed())
    }
}
