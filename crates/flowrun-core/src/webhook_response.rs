// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-process delivery of synchronous webhook responses.
//!
//! A server instance holding an open HTTP connection registers a listener
//! for the run's execution-correlation id. The worker that finishes the run
//! may live on any instance; it publishes the response on the channel of
//! the holding instance (`engine-run:sync:<serverId>`), whose subscription
//! resolves the listener.
//!
//! Each correlation id resolves at most once. Whichever comes first, publish
//! or timeout, wins; later publishes are ignored.
//!
//! If the subscription is lost (e.g. the Redis connection drops) the
//! watcher resubscribes with exponential backoff until shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::pubsub::PubSub;

/// Prefix of per-server response channels.
pub const SYNC_CHANNEL_PREFIX: &str = "engine-run:sync:";

/// First wait before resubscribing after the subscription is lost.
const RESUBSCRIBE_BACKOFF_INITIAL: Duration = Duration::from_millis(100);

/// Upper bound of the resubscribe backoff.
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Response channel of a server instance.
pub fn sync_channel(server_id: &str) -> String {
    format!("{}{}", SYNC_CHANNEL_PREFIX, server_id)
}

/// HTTP response produced by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHttpResponse {
    pub status: u16,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl EngineHttpResponse {
    /// `204 No Content`, returned when no response arrives in time.
    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: Value::Null,
            headers: HashMap::new(),
        }
    }
}

/// Wire message on a response channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponseMessage {
    pub execution_correlation_id: String,
    pub http_response: EngineHttpResponse,
}

/// Listener registrations by correlation id, tagged with the registration
/// they belong to.
type PendingMap = DashMap<String, (u64, oneshot::Sender<EngineHttpResponse>)>;

/// A registered listener awaiting its response.
///
/// Dropping it unregisters the listener, unless a newer listener has since
/// been registered for the same id.
pub struct PendingResponse {
    execution_correlation_id: String,
    registration: u64,
    rx: oneshot::Receiver<EngineHttpResponse>,
    pending: Arc<PendingMap>,
    timeout: Option<Duration>,
}

impl PendingResponse {
    /// Execution-correlation id this listener waits for.
    pub fn execution_correlation_id(&self) -> &str {
        &self.execution_correlation_id
    }

    /// Wait for the response.
    ///
    /// Never fails: a timeout resolves to [`EngineHttpResponse::no_content`].
    pub async fn wait(mut self) -> EngineHttpResponse {
        let received = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, &mut self.rx)
                .await
                .ok()
                .and_then(|r| r.ok()),
            None => (&mut self.rx).await.ok(),
        };

        received.unwrap_or_else(|| {
            debug!(
                execution_correlation_id = %self.execution_correlation_id,
                "No response before timeout"
            );
            EngineHttpResponse::no_content()
        })
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let registration = self.registration;
        self.pending
            .remove_if(&self.execution_correlation_id, |_, (owner, _)| {
                *owner == registration
            });
    }
}

/// Per-process registry of waiting synchronous callers.
pub struct WebhookResponseWatcher {
    server_id: String,
    pending: Arc<PendingMap>,
    next_registration: AtomicU64,
    pubsub: Arc<dyn PubSub>,
    timeout: Duration,
}

impl WebhookResponseWatcher {
    /// Create a watcher with a freshly generated server id.
    pub fn new(pubsub: Arc<dyn PubSub>, timeout: Duration) -> Self {
        Self::with_server_id(uuid::Uuid::new_v4().to_string(), pubsub, timeout)
    }

    pub fn with_server_id(
        server_id: impl Into<String>,
        pubsub: Arc<dyn PubSub>,
        timeout: Duration,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            pending: Arc::new(DashMap::new()),
            next_registration: AtomicU64::new(0),
            pubsub,
            timeout,
        }
    }

    /// Id of this server instance; callers pass it as the synchronous
    /// handler id of the runs they wait for.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Number of registered listeners.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Register a listener for `execution_correlation_id`.
    ///
    /// The listener is registered before this returns, so a response
    /// published right after cannot be missed. Registering the same id
    /// again replaces the earlier listener, which then resolves with
    /// [`EngineHttpResponse::no_content`].
    pub fn one_time_listener(
        &self,
        execution_correlation_id: &str,
        with_timeout: bool,
    ) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        if self
            .pending
            .insert(execution_correlation_id.to_string(), (registration, tx))
            .is_some()
        {
            warn!(
                execution_correlation_id = %execution_correlation_id,
                "Replacing existing response listener"
            );
        }
        PendingResponse {
            execution_correlation_id: execution_correlation_id.to_string(),
            registration,
            rx,
            pending: Arc::clone(&self.pending),
            timeout: with_timeout.then_some(self.timeout),
        }
    }

    /// Send a response to the server instance holding the caller.
    pub async fn publish(
        &self,
        execution_correlation_id: &str,
        target_server_id: &str,
        response: EngineHttpResponse,
    ) -> Result<()> {
        let message = SyncResponseMessage {
            execution_correlation_id: execution_correlation_id.to_string(),
            http_response: response,
        };
        let body = serde_json::to_string(&message)?;
        self.pubsub
            .publish(&sync_channel(target_server_id), &body)
            .await
    }

    /// Resolve a local listener. Returns `false` if none was waiting.
    pub fn resolve(&self, execution_correlation_id: &str, response: EngineHttpResponse) -> bool {
        match self.pending.remove(execution_correlation_id) {
            Some((_, (_, tx))) => tx.send(response).is_ok(),
            None => {
                debug!(
                    execution_correlation_id = %execution_correlation_id,
                    "No listener for response, ignoring"
                );
                false
            }
        }
    }

    fn handle_message(&self, raw: &str) {
        match serde_json::from_str::<SyncResponseMessage>(raw) {
            Ok(message) => {
                self.resolve(&message.execution_correlation_id, message.http_response);
            }
            Err(e) => warn!(error = %e, "Malformed sync response message"),
        }
    }

    /// Subscribe to this instance's channel and resolve listeners until
    /// `shutdown` is notified.
    ///
    /// Fails only if the first subscription fails; later losses are retried.
    pub async fn start(self: &Arc<Self>, shutdown: Arc<Notify>) -> Result<JoinHandle<()>> {
        let channel = sync_channel(&self.server_id);
        let messages = self.pubsub.subscribe(&channel).await?;
        let watcher = Arc::clone(self);

        info!(server_id = %self.server_id, "Webhook response watcher started");

        Ok(tokio::spawn(async move {
            let mut messages = Some(messages);
            let mut backoff = RESUBSCRIBE_BACKOFF_INITIAL;

            loop {
                if messages.is_none() {
                    tokio::select! {
                        biased;

                        _ = shutdown.notified() => {
                            info!("Webhook response watcher received shutdown signal");
                            break;
                        }

                        _ = tokio::time::sleep(backoff) => {
                            messages = watcher.resubscribe(&channel, &mut backoff).await;
                        }
                    }
                    continue;
                }
                let Some(subscription) = messages.as_mut() else {
                    continue;
                };

                let closed = tokio::select! {
                    biased;

                    _ = shutdown.notified() => {
                        info!("Webhook response watcher received shutdown signal");
                        break;
                    }

                    message = subscription.recv() => match message {
                        Some(raw) => {
                            watcher.handle_message(&raw);
                            false
                        }
                        None => true,
                    }
                };

                if closed {
                    warn!(
                        channel = %channel,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Response subscription closed, resubscribing"
                    );
                    messages = None;
                }
            }
            info!(server_id = %watcher.server_id, "Webhook response watcher stopped");
        }))
    }

    async fn resubscribe(
        &self,
        channel: &str,
        backoff: &mut Duration,
    ) -> Option<mpsc::Receiver<String>> {
        match self.pubsub.subscribe(channel).await {
            Ok(messages) => {
                info!(channel = %channel, "Response subscription restored");
                *backoff = RESUBSCRIBE_BACKOFF_INITIAL;
                Some(messages)
            }
            Err(e) => {
                *backoff = (*backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
                error!(
                    channel = %channel,
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Failed to resubscribe to response channel"
                );
                None
            }
        }
    }
}
