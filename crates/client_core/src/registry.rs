use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{domain::ChannelKey, protocol::ServerEventKind};
use tracing::{debug, info, warn};

use crate::{
    error::SyncError,
    router::{ChannelKeyExtractor, EventCallback, HandlerId, HandlerScope, LiveEventRouter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionHealth {
    Active,
    Pending,
    /// The retry after a failed join failed as well. Live updates for this
    /// channel are unavailable until the view is reopened.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub channel: ChannelKey,
    pub joined_at: DateTime<Utc>,
    pub handler: HandlerId,
    pub health: SubscriptionHealth,
    joined_epoch: Option<u64>,
    failed_joins: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
    Deferred(SyncError),
}

#[derive(Clone)]
pub struct ChannelBinding {
    pub extractor: ChannelKeyExtractor,
    pub callback: EventCallback,
}

pub struct ChannelRegistry {
    router: Arc<LiveEventRouter>,
    binding: Option<ChannelBinding>,
    subscriptions: HashMap<ChannelKey, Subscription>,
}

impl ChannelRegistry {
    pub fn new(router: Arc<LiveEventRouter>) -> Self {
        Self {
            router,
            binding: None,
            subscriptions: HashMap::new(),
        }
    }

    pub fn bind(&mut self, binding: ChannelBinding) {
        self.binding = Some(binding);
    }

    pub fn is_joined(&self, channel: &ChannelKey) -> bool {
        self.subscriptions.contains_key(channel)
    }

    pub fn subscription(&self, channel: &ChannelKey) -> Option<&Subscription> {
        self.subscriptions.get(channel)
    }

    pub fn joined(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<_> = self.subscriptions.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub async fn join(&mut self, channel: ChannelKey) -> JoinOutcome {
        if self.subscriptions.contains_key(&channel) {
            debug!(channel = %channel, "registry: already joined");
            return JoinOutcome::AlreadyJoined;
        }

        // Handler first, so events that follow the join immediately are routed.
        let handler = match &self.binding {
            Some(binding) => {
                self.router
                    .register_handler(
                        ServerEventKind::for_channel(channel),
                        HandlerScope::Channel(channel),
                        Some(Arc::clone(&binding.extractor)),
                        Arc::clone(&binding.callback),
                    )
                    .await
            }
            None => {
                warn!(channel = %channel, "registry: joining without a bound handler");
                0
            }
        };

        let mut subscription = Subscription {
            channel,
            joined_at: Utc::now(),
            handler,
            health: SubscriptionHealth::Pending,
            joined_epoch: None,
            failed_joins: 0,
        };

        let outcome = match self.router.join(channel).await {
            Ok(epoch) => {
                subscription.health = SubscriptionHealth::Active;
                subscription.joined_epoch = Some(epoch);
                info!(channel = %channel, epoch, "registry: joined channel");
                JoinOutcome::Joined
            }
            Err(err) => {
                if matches!(err, SyncError::ChannelJoinFailed { .. }) {
                    subscription.failed_joins = 1;
                }
                warn!(channel = %channel, %err, "registry: join deferred until next connection");
                JoinOutcome::Deferred(err)
            }
        };
        self.subscriptions.insert(channel, subscription);
        outcome
    }

    pub async fn leave(&mut self, channel: ChannelKey) -> bool {
        let Some(subscription) = self.subscriptions.remove(&channel) else {
            return false;
        };
        // Detach before the transport leave so nothing for this channel is
        // delivered once leaving has begun.
        self.router.remove_handler(subscription.handler).await;

        if subscription.joined_epoch == Some(self.router.epoch()) {
            match self.router.leave(channel).await {
                Ok(_) => info!(channel = %channel, "registry: left channel"),
                Err(err) => warn!(channel = %channel, %err, "registry: transport leave failed"),
            }
        } else {
            debug!(channel = %channel, "registry: dropped subscription not joined on this connection");
        }
        true
    }

    pub async fn switch_to(&mut self, current: Option<ChannelKey>, next: ChannelKey) -> JoinOutcome {
        if current == Some(next) {
            return self.join(next).await;
        }
        if let Some(current) = current {
            self.leave(current).await;
        }
        self.join(next).await
    }

    /// Issues exactly one transport join for every subscription not yet joined
    /// on the current connection epoch. Returns the channels that failed.
    pub async fn rejoin(&mut self) -> Vec<(ChannelKey, SyncError)> {
        let epoch = self.router.epoch();
        let mut failures = Vec::new();
        let mut channels: Vec<ChannelKey> = self
            .subscriptions
            .values()
            .filter(|s| s.joined_epoch != Some(epoch) && s.health != SubscriptionHealth::Degraded)
            .map(|s| s.channel)
            .collect();
        channels.sort();

        for channel in channels {
            let result = self.router.join(channel).await;
            let Some(subscription) = self.subscriptions.get_mut(&channel) else {
                continue;
            };
            match result {
                Ok(joined_epoch) => {
                    subscription.joined_epoch = Some(joined_epoch);
                    subscription.health = SubscriptionHealth::Active;
                    subscription.failed_joins = 0;
                    info!(channel = %channel, epoch = joined_epoch, "registry: rejoined channel");
                }
                Err(err) => {
                    subscription.joined_epoch = None;
                    if matches!(err, SyncError::ChannelJoinFailed { .. }) {
                        subscription.failed_joins = subscription.failed_joins.saturating_add(1);
                    }
                    subscription.health = if subscription.failed_joins >= 2 {
                        SubscriptionHealth::Degraded
                    } else {
                        SubscriptionHealth::Pending
                    };
                    warn!(channel = %channel, %err, health = ?subscription.health, "registry: rejoin failed");
                    failures.push((channel, err));
                }
            }
        }
        failures
    }

    pub async fn clear(&mut self) {
        for (_, subscription) in self.subscriptions.drain() {
            self.router.remove_handler(subscription.handler).await;
        }
        self.binding = None;
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
