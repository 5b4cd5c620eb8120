//! Subscription registry and inbound frame demultiplexing

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::dispatcher::Handler;
use crate::models::{GroupId, Inbound};
use crate::stomp::{Command, Frame};

/// A logical stream on the shared connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Messages addressed to the current user.
    PrivateInbox,
    /// Public broadcast channel.
    Public,
    Group(GroupId),
}

impl Channel {
    pub fn destination(&self) -> String {
        match self {
            Channel::PrivateInbox => "/user/queue/messages".to_string(),
            Channel::Public => "/topic/public".to_string(),
            Channel::Group(id) => format!("/topic/group.{}", id),
        }
    }

    fn decode(&self, body: &str) -> serde_json::Result<Inbound> {
        match self {
            Channel::PrivateInbox | Channel::Public => Inbound::decode_direct(body),
            Channel::Group(_) => Inbound::decode_group(body),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination())
    }
}

/// STOMP subscription id, rendered as `sub-N` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn parse(s: &str) -> Option<Self> {
        s.strip_prefix("sub-")?.parse::<u64>().ok().map(SubscriptionId)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscription {
    channel: Channel,
    handler: Handler,
}

/// What happened to a routed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// No live registration for the frame's subscription.
    Unrouted,
    /// Body was not a valid message for the channel.
    Undecodable,
    /// Not a MESSAGE frame.
    Ignored,
}

/// Registry of channel subscriptions.
///
/// Registrations outlive individual connections: the connector replays
/// them on every (re)connect, so a subscription requested before the
/// connection exists simply waits for it.
#[derive(Default)]
pub struct Router {
    next_id: AtomicU64,
    subscriptions: Mutex<BTreeMap<SubscriptionId, Subscription>>,
}

impl Router {
    /// Register a handler for `channel`. Every call yields a new subscription.
    pub fn register(&self, channel: Channel, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!("Registering {} for {}", id, channel);
        self.lock().insert(id, Subscription { channel, handler });
        id
    }

    /// Drop a registration, returning its channel if it existed.
    pub fn remove(&self, id: SubscriptionId) -> Option<Channel> {
        let removed = self.lock().remove(&id).map(|s| s.channel);
        if let Some(ref channel) = removed {
            tracing::debug!("Removed {} for {}", id, channel);
        }
        removed
    }

    pub fn destination_of(&self, id: SubscriptionId) -> Option<String> {
        self.lock().get(&id).map(|s| s.channel.destination())
    }

    /// All registrations in creation order, as (id, destination).
    pub fn snapshot(&self) -> Vec<(SubscriptionId, String)> {
        self.lock()
            .iter()
            .map(|(id, s)| (*id, s.channel.destination()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Decode a MESSAGE frame and hand it to its subscription's handler.
    ///
    /// Decode failures are contained to the frame.
    pub fn route(&self, frame: &Frame) -> RouteOutcome {
        if frame.command != Command::Message {
            return RouteOutcome::Ignored;
        }

        let Some(id) = frame.get("subscription").and_then(SubscriptionId::parse) else {
            tracing::warn!(
                "MESSAGE without a usable subscription header (destination={:?})",
                frame.get("destination")
            );
            return RouteOutcome::Unrouted;
        };

        let (channel, handler) = {
            let guard = self.lock();
            match guard.get(&id) {
                Some(s) => (s.channel.clone(), Arc::clone(&s.handler)),
                None => {
                    tracing::debug!("Dropping MESSAGE for inactive {}", id);
                    return RouteOutcome::Unrouted;
                }
            }
        };

        match channel.decode(&frame.body) {
            Ok(message) => {
                handler(&message);
                RouteOutcome::Delivered
            }
            Err(e) => {
                tracing::warn!("Undecodable frame on {}: {} (body={:?})", channel, e, frame.body);
                RouteOutcome::Undecodable
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SubscriptionId, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
