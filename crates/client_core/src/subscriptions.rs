use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use backend::{ChannelHandle, ChatBackend, EventReceiver};
use shared::{
    domain::UserId,
    error::BackendError,
    protocol::{ChannelTopic, RealtimeEvent},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Receives the events of one subscription, in transport order.
#[async_trait]
pub trait RealtimeSink: Send + Sync {
    async fn deliver(&self, subscription: &Subscription, event: RealtimeEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub topic: ChannelTopic,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

enum Slot {
    Subscribing {
        generation: u64,
    },
    Subscribed {
        generation: u64,
        handle: ChannelHandle,
        forwarder: JoinHandle<()>,
    },
}

impl Slot {
    fn generation(&self) -> u64 {
        match self {
            Slot::Subscribing { generation } | Slot::Subscribed { generation, .. } => *generation,
        }
    }
}

pub struct SubscriptionManager {
    backend: Arc<dyn ChatBackend>,
    slots: Mutex<HashMap<ChannelTopic, Slot>>,
    next_generation: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Returns `Ok(false)` when the topic already has a live or pending
    /// channel, or when an unsubscribe won the race against this call.
    pub async fn subscribe(
        &self,
        subscription: Subscription,
        sink: Arc<dyn RealtimeSink>,
    ) -> Result<bool, BackendError> {
        let topic = subscription.topic;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut slots = self.slots.lock().await;
            if slots.contains_key(&topic) {
                debug!("realtime: already subscribed topic={topic}");
                return Ok(false);
            }
            slots.insert(topic, Slot::Subscribing { generation });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = match self.backend.open_channel(topic, events_tx).await {
            Ok(handle) => handle,
            Err(err) => {
                let mut slots = self.slots.lock().await;
                if slots.get(&topic).map(Slot::generation) == Some(generation) {
                    slots.remove(&topic);
                }
                warn!("realtime: failed to open channel topic={topic}: {err}");
                return Err(err);
            }
        };

        let mut slots = self.slots.lock().await;
        let still_wanted = matches!(
            slots.get(&topic),
            Some(Slot::Subscribing { generation: pending }) if *pending == generation
        );
        if !still_wanted {
            drop(slots);
            debug!("realtime: subscription cancelled while opening topic={topic}");
            self.close_quietly(handle).await;
            return Ok(false);
        }

        let forwarder = tokio::spawn(forward_events(subscription, events_rx, sink));
        slots.insert(
            topic,
            Slot::Subscribed {
                generation,
                handle,
                forwarder,
            },
        );
        info!(user_id = %subscription.user_id, "realtime: subscribed topic={topic}");
        Ok(true)
    }

    /// Always ends `Unsubscribed`; channel close failures are only logged.
    pub async fn unsubscribe(&self, topic: ChannelTopic) -> bool {
        let removed = self.slots.lock().await.remove(&topic);
        match removed {
            None => false,
            Some(Slot::Subscribing { .. }) => {
                debug!("realtime: dropped pending subscription topic={topic}");
                true
            }
            Some(Slot::Subscribed {
                handle, forwarder, ..
            }) => {
                forwarder.abort();
                self.close_quietly(handle).await;
                info!("realtime: unsubscribed topic={topic}");
                true
            }
        }
    }

    pub async fn unsubscribe_all(&self) {
        let drained = self.slots.lock().await.drain().collect::<Vec<_>>();
        for (topic, slot) in drained {
            if let Slot::Subscribed {
                handle, forwarder, ..
            } = slot
            {
                forwarder.abort();
                self.close_quietly(handle).await;
                debug!("realtime: closed topic={topic}");
            }
        }
    }

    pub async fn state(&self, topic: ChannelTopic) -> SubscriptionState {
        match self.slots.lock().await.get(&topic) {
            None => SubscriptionState::Unsubscribed,
            Some(Slot::Subscribing { .. }) => SubscriptionState::Subscribing,
            Some(Slot::Subscribed { .. }) => SubscriptionState::Subscribed,
        }
    }

    pub async fn active_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Subscribed { .. }))
            .count()
    }

    async fn close_quietly(&self, handle: ChannelHandle) {
        if let Err(err) = self.backend.close_channel(handle).await {
            warn!("realtime: failed to close channel topic={}: {err}", handle.topic);
        }
    }
}

async fn forward_events(
    subscription: Subscription,
    mut events: EventReceiver,
    sink: Arc<dyn RealtimeSink>,
) {
    while let Some(event) = events.recv().await {
        sink.deliver(&subscription, event).await;
    }
    debug!("realtime: event stream ended topic={}", subscription.topic);
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;
