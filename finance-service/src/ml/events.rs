//! Config change notifications.
//!
//! Every API and job instance keeps its own ML config cache. Writers publish a
//! [`ConfigEvent`] and each instance's cache listens on the bus. With Redis
//! configured, events also travel over the `ml-config:invalidate` channel so
//! other instances see them.

use super::config_store::MlConfigCategory;
use futures::StreamExt;
use redis::{aio::ConnectionManager, Client};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const INVALIDATION_CHANNEL: &str = "ml-config:invalidate";

const BUS_CAPACITY: usize = 64;
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigEvent {
    /// Cached config is stale. `None` means every category.
    Invalidated { category: Option<MlConfigCategory> },
}

/// Wire format on the Redis channel. `origin` lets an instance ignore its
/// own messages, which it already delivered locally.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    event: ConfigEvent,
}

#[derive(Clone)]
pub struct ConfigEventBus {
    instance_id: Uuid,
    sender: broadcast::Sender<ConfigEvent>,
    redis: Option<ConnectionManager>,
}

impl Default for ConfigEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigEventBus {
    /// In-process bus only.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            instance_id: Uuid::new_v4(),
            sender,
            redis: None,
        }
    }

    /// Bus bridged to Redis pub/sub. Spawns a task that forwards messages
    /// from other instances into the local bus.
    pub async fn with_redis(client: Client) -> Result<Self, AppError> {
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            AppError::RedisError(e)
        })?;

        let mut bus = Self::new();
        bus.redis = Some(manager);
        spawn_redis_forwarder(client, bus.instance_id, bus.sender.clone());

        tracing::info!(channel = INVALIDATION_CHANNEL, "Config event bus bridged to Redis");
        Ok(bus)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.sender.subscribe()
    }

    /// Deliver locally, then fan out to other instances when Redis is
    /// configured. A Redis failure is logged and never fails the caller.
    pub async fn publish(&self, event: ConfigEvent) {
        self.deliver_local(event.clone());

        let Some(manager) = &self.redis else {
            return;
        };

        let envelope = Envelope {
            origin: self.instance_id,
            event,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode config event");
                return;
            }
        };

        let mut conn = manager.clone();
        let published: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
            .arg(INVALIDATION_CHANNEL)
            .arg(payload)
            .query_async(&mut conn)
            .await;

        match published {
            Ok(receivers) => tracing::debug!(receivers, "Config event published to Redis"),
            Err(e) => tracing::warn!(
                error = %e,
                "Failed to publish config event to Redis, other instances will refresh on TTL"
            ),
        }
    }

    fn deliver_local(&self, event: ConfigEvent) {
        // No receivers is not an error: nothing is cached yet.
        if self.sender.send(event).is_err() {
            tracing::debug!("Config event published with no local subscribers");
        }
    }
}

fn spawn_redis_forwarder(client: Client, instance_id: Uuid, sender: broadcast::Sender<ConfigEvent>) {
    tokio::spawn(async move {
        loop {
            match forward_messages(&client, instance_id, &sender).await {
                Ok(()) => tracing::warn!("Redis config subscription ended, resubscribing"),
                Err(e) => tracing::warn!(error = %e, "Redis config subscription failed, retrying"),
            }
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    });
}

async fn forward_messages(
    client: &Client,
    instance_id: Uuid,
    sender: &broadcast::Sender<ConfigEvent>,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(INVALIDATION_CHANNEL).await?;

    // Messages sent while we were not subscribed are lost; start clean.
    let _ = sender.send(ConfigEvent::Invalidated { category: None });

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable config event payload");
                continue;
            }
        };

        forward_payload(&payload, instance_id, sender);
    }

    Ok(())
}

/// Deliver one Redis payload to the local bus. Returns false for this
/// instance's own echoes and for malformed payloads.
fn forward_payload(
    payload: &str,
    instance_id: Uuid,
    sender: &broadcast::Sender<ConfigEvent>,
) -> bool {
    match serde_json::from_str::<Envelope>(payload) {
        Ok(envelope) if envelope.origin == instance_id => false,
        Ok(envelope) => {
            tracing::debug!(event = ?envelope.event, "Config event received from Redis");
            let _ = sender.send(envelope.event);
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, payload = %payload, "Malformed config event");
            false
        }
    }
}
