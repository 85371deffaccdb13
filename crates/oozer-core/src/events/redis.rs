//! Redis-backed event bus.
//!
//! Publishes serialized events on a named channel and exposes a pub/sub
//! subscription stream. The publisher connection is established lazily and
//! dropped on error so the next publish reconnects.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::warn;

use super::{Event, EventBus};

pub struct RedisBus {
    client: redis::Client,
    channel: String,
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBus {
    /// Build a bus for the given Redis URL and channel name. Fails only on
    /// an unparseable URL; no connection is attempted yet.
    pub fn new(url: &str, channel: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            channel: channel.to_owned(),
            publisher: Mutex::new(None),
        })
    }

    async fn try_publish(&self, payload: &str) -> anyhow::Result<()> {
        let mut guard = self.publisher.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_multiplexed_async_connection().await?);
        }
        // The unwrap cannot fire: the branch above just filled the slot.
        let conn = guard.as_mut().expect("publisher connection present");

        let result: redis::RedisResult<()> = conn.publish(&self.channel, payload).await;
        if let Err(e) = result {
            // Drop the broken connection so the next publish reconnects.
            *guard = None;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, event: &Event) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize event");
                return;
            }
        };

        if let Err(e) = self.try_publish(&payload).await {
            warn!(error = %e, channel = %self.channel, "event publish failed");
        }
    }

    async fn ping(&self) -> bool {
        match self.client.get_multiplexed_async_connection().await {
            Ok(mut conn) => {
                let pong: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut conn).await;
                pong.is_ok()
            }
            Err(_) => false,
        }
    }

    async fn subscribe(&self) -> anyhow::Result<BoxStream<'static, Event>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        // Dropping the stream drops the pub/sub connection, which is the
        // unsubscribe path for cancelled forwarder tasks.
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(stream.boxed())
    }
}
