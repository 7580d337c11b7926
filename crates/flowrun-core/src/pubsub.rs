// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Publish/subscribe transport.
//!
//! Used to route synchronous responses to the server instance that holds the
//! waiting caller. Messages are plain strings; callers serialize.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

/// Buffered messages per subscription before publishers wait.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Channel-based message transport.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `message` on `channel`. Publishing with no subscriber is not
    /// an error.
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribe to `channel`. The subscription ends when the receiver is
    /// dropped. If the transport loses its connection the receiver yields
    /// `None`; callers resubscribe.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}

/// Redis PUBLISH / SUBSCRIBE transport.
pub struct RedisPubSub {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisPubSub {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, message).await?;
        debug!(channel = %channel, receivers = receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            debug!(channel = %channel, "Subscriber dropped");
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping undecodable message");
                    }
                }
            }
            warn!(channel = %channel, "Subscription connection lost");
        });

        Ok(rx)
    }
}

/// In-process transport for single-instance deployments and tests.
#[derive(Default, Clone)]
pub struct MemoryPubSub {
    subscribers: Arc<DashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl MemoryPubSub {
    /// Create a transport with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .get(channel)
            .map_or(0, |entry| entry.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// End every subscription to `channel`, as a dropped connection would.
    pub fn disconnect(&self, channel: &str) {
        if let Some((_, senders)) = self.subscribers.remove(channel) {
            debug!(channel = %channel, subscriptions = senders.len(), "Subscriptions dropped");
        }
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // Clone the senders out so no map guard is held across a send.
        let senders = match self.subscribers.get_mut(channel) {
            Some(mut entry) => {
                entry.retain(|tx| !tx.is_closed());
                entry.clone()
            }
            None => return Ok(()),
        };

        for tx in senders {
            let _ = tx.send(message.to_string()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
