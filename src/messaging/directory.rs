//! Per-view cache of user display names
//!
//! Lookups never block rendering: an unknown id renders as a placeholder
//! while the name is fetched in the background, and a [`NameResolved`]
//! update is sent once it arrives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::UserId;

/// Source of display names.
pub trait UserDirectory: Send + Sync {
    fn display_name(&self, id: UserId) -> BoxFuture<'_, anyhow::Result<String>>;
}

/// A lookup finished with a real name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameResolved {
    pub user_id: UserId,
    pub name: String,
}

pub fn placeholder(id: UserId) -> String {
    format!("User {}", id)
}

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Resolved(String),
    Failed,
}

#[derive(Default)]
struct State {
    slots: HashMap<UserId, Slot>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

pub struct DirectoryCache {
    directory: Arc<dyn UserDirectory>,
    state: Arc<Mutex<State>>,
    updates: mpsc::UnboundedSender<NameResolved>,
}

impl DirectoryCache {
    pub fn new(directory: Arc<dyn UserDirectory>) -> (Self, mpsc::UnboundedReceiver<NameResolved>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let cache = Self {
            directory,
            state: Arc::new(Mutex::new(State::default())),
            updates,
        };
        (cache, rx)
    }

    /// Name to show for `id` right now. Starts a lookup on first sight.
    pub fn resolve(&self, id: UserId) -> String {
        if let Some(name) = self.cached(id) {
            return name;
        }
        self.prefetch([id]);
        placeholder(id)
    }

    /// The resolved name, if any. Never starts a lookup.
    pub fn cached(&self, id: UserId) -> Option<String> {
        match self.lock().slots.get(&id) {
            Some(Slot::Resolved(name)) => Some(name.clone()),
            _ => None,
        }
    }

    /// Look up every id not seen before, concurrently, in one task.
    pub fn prefetch(&self, ids: impl IntoIterator<Item = UserId>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }

        let mut fresh: Vec<UserId> = Vec::new();
        for id in ids {
            if !state.slots.contains_key(&id) {
                state.slots.insert(id, Slot::Pending);
                fresh.push(id);
            }
        }
        if fresh.is_empty() {
            return;
        }

        tracing::debug!("Looking up {} user name(s)", fresh.len());
        let directory = Arc::clone(&self.directory);
        let slots = Arc::clone(&self.state);
        let updates = self.updates.clone();

        let task = tokio::spawn(async move {
            let lookups = fresh.iter().map(|&id| {
                let directory = Arc::clone(&directory);
                async move { (id, directory.display_name(id).await) }
            });

            for (id, result) in join_all(lookups).await {
                let slot = match result {
                    Ok(name) => {
                        let _ = updates.send(NameResolved {
                            user_id: id,
                            name: name.clone(),
                        });
                        Slot::Resolved(name)
                    }
                    Err(e) => {
                        tracing::warn!("Could not resolve user {}: {:#}", id, e);
                        Slot::Failed
                    }
                };
                slots
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .slots
                    .insert(id, slot);
            }
        });

        state.tasks.retain(|t| !t.is_finished());
        state.tasks.push(task);
    }

    /// Abort outstanding lookups. Later calls resolve to placeholders only.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.closed = true;
        for task in state.tasks.drain(..) {
            task.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for DirectoryCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
