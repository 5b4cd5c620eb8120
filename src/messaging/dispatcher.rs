//! Outbound publishing and the shared message handler registry

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::connector::{ConnCommand, ConnectionState, Connector};
use super::error::Result;
use crate::models::{Identity, Inbound, Outbound};

/// Callback invoked for every inbound message on a stream.
pub type Handler = Arc<dyn Fn(&Inbound) + Send + Sync>;

/// Token returned by [`MessageHandlers::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registered {
    id: HandlerId,
    active: Arc<AtomicBool>,
    handler: Handler,
}

/// Ordered collection of handlers for one logical stream.
///
/// A handler is never invoked once `remove` has returned for it, including
/// by a dispatch that is already walking the list.
#[derive(Default)]
pub struct MessageHandlers {
    next_id: AtomicU64,
    handlers: Mutex<Vec<Registered>>,
}

impl MessageHandlers {
    pub fn register(&self, handler: impl Fn(&Inbound) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(Registered {
            id,
            active: Arc::new(AtomicBool::new(true)),
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut guard = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        match guard.iter().position(|r| r.id == id) {
            Some(pos) => {
                let removed = guard.remove(pos);
                removed.active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Invoke every active handler in registration order.
    pub fn dispatch(&self, message: &Inbound) {
        // Snapshot so handlers may register/remove without deadlocking.
        let snapshot: Vec<(Arc<AtomicBool>, Handler)> = {
            let guard = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .iter()
                .map(|r| (Arc::clone(&r.active), Arc::clone(&r.handler)))
                .collect()
        };
        for (active, handler) in snapshot {
            if active.load(Ordering::SeqCst) {
                handler(message);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Publishes outbound messages through the connector.
///
/// Stateless: a publish issued while the connection is down is dropped.
/// Delivery can only be observed through the echo on a subscription.
#[derive(Clone)]
pub struct Dispatcher {
    connector: Connector,
}

impl Dispatcher {
    pub fn new(connector: Connector) -> Self {
        Self { connector }
    }

    /// Serialize `payload` to JSON and send it to `destination`.
    ///
    /// Errors only on serialization failure.
    pub fn publish<T: Serialize + ?Sized>(&self, destination: &str, payload: &T) -> Result<()> {
        let body = serde_json::to_string(payload)?;

        if self.connector.state() != ConnectionState::Connected {
            tracing::debug!("Not connected, dropping publish to {}", destination);
            return Ok(());
        }

        self.connector.command(ConnCommand::Publish {
            destination: destination.to_string(),
            body,
        });
        Ok(())
    }

    pub fn send(&self, outbound: &Outbound) -> Result<()> {
        self.publish(outbound.destination(), &outbound.payload())
    }

    /// Tell the server which identity is on this connection.
    pub fn announce_presence(&self, identity: &Identity) {
        tracing::info!("Announcing presence as {} (id={})", identity.email, identity.id);
        if let Err(e) = self.send(&Outbound::Join(identity.clone())) {
            tracing::warn!("Presence announcement failed: {}", e);
        }
    }
}
