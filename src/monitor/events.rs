//! Engine event delivery.
//!
//! Events reach consumers two ways: synchronous handlers registered with
//! [`EventBus::subscribe`], called inline on the thread that produced the
//! event, and a broadcast channel for async consumers such as an
//! [`AlertSink`] forwarder. Handlers run on the admission hot path and must
//! return quickly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::alert::{Alert, AlertId};
use crate::ratelimit::RuleId;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something observable that happened inside the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    AlertRaised(Alert),
    IdentifierBlocked {
        rule_id: RuleId,
        identifier: String,
        block_expiry: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    AlertAcknowledged {
        alert_id: AlertId,
        at: DateTime<Utc>,
    },
}

/// Discriminant used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AlertRaised,
    IdentifierBlocked,
    AlertAcknowledged,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::AlertRaised(_) => EventKind::AlertRaised,
            EngineEvent::IdentifierBlocked { .. } => EventKind::IdentifierBlocked,
            EngineEvent::AlertAcknowledged { .. } => EventKind::AlertAcknowledged,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type EventHandler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: EventHandler,
}

/// Fan-out of engine events to handlers and stream consumers.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    /// Register a handler for one kind of event.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
        });
        debug!(subscription = id.0, kind = ?kind, "Event handler subscribed");
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Deliver an event to matching handlers and stream receivers.
    pub fn publish(&self, event: EngineEvent) {
        let kind = event.kind();
        // Handlers are called outside the lock so they may (un)subscribe.
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            handler(&event);
        }

        // No receivers is the common case and not an error.
        let _ = self.sender.send(event);
    }

    /// A stream of every event published after this call.
    pub fn stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn handler_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// External destination for alerts, e.g. an audit store or pager.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Forward every raised alert to `sink` until the bus is dropped.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_alert_forwarder(bus: &EventBus, sink: Arc<dyn AlertSink>) -> JoinHandle<()> {
    let mut events = bus.stream();
    tokio::spawn(async move {
        while let Some(item) = events.next().await {
            match item {
                Ok(EngineEvent::AlertRaised(alert)) => {
                    if let Err(e) = sink.deliver(&alert).await {
                        warn!(alert_id = %alert.id, error = %e, "Alert sink delivery failed");
                    }
                }
                Ok(_) => {}
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Alert forwarder lagged; events dropped");
                }
            }
        }
        debug!("Alert forwarder stopped");
    })
}
