//! Process-wide messaging context
//!
//! One `ChatContext` owns the shared connection. Views take a [`Lease`] on
//! mount; the first lease connects and dropping the last one disconnects.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::connector::{ConnCommand, ConnectionState, Connector, TransportSettings};
use super::dispatcher::{Dispatcher, Handler, HandlerId, MessageHandlers};
use super::reconcile::DEFAULT_ECHO_WINDOW;
use super::router::{Channel, SubscriptionId};
use crate::models::{Identity, Inbound};

#[derive(Default)]
struct Leases {
    count: usize,
    presence: Option<JoinHandle<()>>,
}

struct Inner {
    identity: Identity,
    connector: Connector,
    dispatcher: Dispatcher,
    /// Fan-out for the private inbox and public channel.
    direct_handlers: Arc<MessageHandlers>,
    leases: Mutex<Leases>,
}

impl Inner {
    fn lock_leases(&self) -> std::sync::MutexGuard<'_, Leases> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self) {
        let mut leases = self.lock_leases();
        leases.count = leases.count.saturating_sub(1);
        if leases.count > 0 {
            return;
        }
        tracing::debug!("Last chat view released, closing connection");
        if let Some(task) = leases.presence.take() {
            task.abort();
        }
        self.connector.disconnect();
    }
}

#[derive(Clone)]
pub struct ChatContext {
    inner: Arc<Inner>,
    echo_window: Duration,
}

impl ChatContext {
    pub fn new(settings: TransportSettings, identity: Identity) -> Self {
        let connector = Connector::new(settings);
        let dispatcher = Dispatcher::new(connector.clone());
        let direct_handlers = Arc::new(MessageHandlers::default());

        for channel in [Channel::PrivateInbox, Channel::Public] {
            let handlers = Arc::clone(&direct_handlers);
            let forward: Handler = Arc::new(move |m: &Inbound| handlers.dispatch(m));
            connector.router().register(channel, forward);
        }

        Self {
            inner: Arc::new(Inner {
                identity,
                connector,
                dispatcher,
                direct_handlers,
                leases: Mutex::new(Leases::default()),
            }),
            echo_window: DEFAULT_ECHO_WINDOW,
        }
    }

    pub fn with_echo_window(mut self, window: Duration) -> Self {
        self.echo_window = window;
        self
    }

    /// Take a share of the connection, connecting if this is the first.
    pub fn lease(&self) -> Lease {
        let mut leases = self.inner.lock_leases();
        leases.count += 1;
        if leases.count == 1 {
            self.inner.connector.connect(&self.inner.identity);
            leases.presence = Some(self.spawn_presence());
        }
        Lease {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Announce presence after every successful (re)connect.
    fn spawn_presence(&self) -> JoinHandle<()> {
        let mut state = self.inner.connector.subscribe_state();
        let dispatcher = self.inner.dispatcher.clone();
        let identity = self.inner.identity.clone();

        tokio::spawn(async move {
            loop {
                if state.wait_for(|s| *s == ConnectionState::Connected).await.is_err() {
                    break;
                }
                dispatcher.announce_presence(&identity);
                if state.wait_for(|s| *s != ConnectionState::Connected).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Register a handler for direct and public traffic.
    pub fn on_message(&self, handler: impl Fn(&Inbound) + Send + Sync + 'static) -> HandlerId {
        self.inner.direct_handlers.register(handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.direct_handlers.remove(id)
    }

    pub fn handler_count(&self) -> usize {
        self.inner.direct_handlers.len()
    }

    /// Subscribe to `channel`. Takes effect now if connected, otherwise on
    /// the next connect.
    pub fn subscribe(&self, channel: Channel, handler: Handler) -> SubscriptionId {
        let id = self.inner.connector.router().register(channel, handler);
        self.inner.connector.command(ConnCommand::Subscribe(id));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.inner.connector.router().remove(id).is_some() {
            self.inner.connector.command(ConnCommand::Unsubscribe(id));
        }
    }

    pub async fn connected(&self) {
        self.inner.connector.connected().await
    }

    /// Wait for the connection, giving up after the configured connect timeout.
    pub async fn connected_within_timeout(&self) -> bool {
        let limit = self.inner.connector.settings().connect_timeout;
        tokio::time::timeout(limit, self.connected()).await.is_ok()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connector.state()
    }

    /// Close the connection now and wait for the socket task to finish.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.lock_leases().presence.take() {
            task.abort();
        }
        self.inner.connector.shutdown().await;
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }

    pub fn echo_window(&self) -> Duration {
        self.echo_window
    }
}

/// A view's share of the connection. Dropping it releases the share.
pub struct Lease {
    inner: Arc<Inner>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.release();
    }
}
