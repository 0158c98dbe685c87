use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

use crate::client::Client;
use crate::metrics;

/// Non-owning handle to a registered client.
///
/// Encodes the registry slot and its generation, so a handle kept past the
/// client's removal never resolves to whichever client reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ClientId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        ClientId { index, generation }
    }

    /// Returns the registry slot index.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

struct Entry {
    generation: u32,
    /// Cleared as soon as removal starts; the client stays reachable through
    /// `client` until its in-flight completions have drained.
    alive: bool,
    client: Option<Arc<Client>>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

/// Authority on which clients are alive.
///
/// Removal is always deferred: [`request_removal`](Self::request_removal)
/// only queues the id, and the client is destroyed later by whoever drains
/// the queue ([`reap`](Self::reap), or the engine's reaper thread). That
/// makes it safe to request removal from inside a completion handler that
/// still borrows the client.
pub struct ClientRegistry {
    slots: RwLock<Slots>,
    removal_tx: Sender<ClientId>,
    removal_rx: Receiver<ClientId>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (removal_tx, removal_rx) = crossbeam_channel::unbounded();
        ClientRegistry {
            slots: RwLock::new(Slots::default()),
            removal_tx,
            removal_rx,
        }
    }

    /// Allocate a slot and register the client built by `make`.
    pub fn register(&self, make: impl FnOnce(ClientId) -> Client) -> Arc<Client> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let index = match slots.free.pop() {
            Some(index) => index,
            None => {
                slots.entries.push(Entry {
                    generation: 0,
                    alive: false,
                    client: None,
                });
                (slots.entries.len() - 1) as u32
            }
        };
        let entry = &mut slots.entries[index as usize];
        let id = ClientId::new(index, entry.generation);
        let client = Arc::new(make(id));
        entry.client = Some(client.clone());
        entry.alive = true;
        metrics::CLIENTS_ACTIVE.increment();
        client
    }

    /// Whether `id` refers to a registered client whose removal has not started.
    pub fn is_alive(&self, id: ClientId) -> bool {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .entries
            .get(id.index as usize)
            .is_some_and(|e| e.generation == id.generation && e.alive)
    }

    /// Look up a client that is alive or still draining.
    pub fn client(&self, id: ClientId) -> Option<Arc<Client>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.client.clone())
    }

    /// Queue `id` for removal. Never destroys synchronously.
    pub fn request_removal(&self, id: ClientId) {
        if !self.is_alive(id) {
            return;
        }
        debug!(client = %id, "removal requested");
        // The receiver lives in `self`, so the channel cannot be disconnected.
        let _ = self.removal_tx.send(id);
    }

    /// Queue of pending removal requests.
    pub fn removals(&self) -> &Receiver<ClientId> {
        &self.removal_rx
    }

    /// Process every queued removal request. Returns the number of clients
    /// destroyed.
    pub fn reap(&self) -> usize {
        let mut removed = 0;
        while let Ok(id) = self.removal_rx.try_recv() {
            if self.remove(id) {
                removed += 1;
            }
        }
        removed
    }

    /// Remove a client now: mark it not alive, destroy it (which waits for
    /// its in-flight completions), then free its slot.
    ///
    /// Returns `false` if the client was already gone or being removed.
    /// Must not be called from a completion handler of the same client.
    pub fn remove(&self, id: ClientId) -> bool {
        let client = {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            match slots.entries.get_mut(id.index as usize) {
                Some(e) if e.generation == id.generation && e.alive => {
                    e.alive = false;
                    e.client.clone()
                }
                _ => None,
            }
        };
        let Some(client) = client else {
            return false;
        };
        metrics::CLIENTS_ACTIVE.decrement();

        client.destroy();

        {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            let entry = &mut slots.entries[id.index as usize];
            entry.client = None;
            entry.generation = entry.generation.wrapping_add(1);
            slots.free.push(id.index);
        }
        metrics::CLIENTS_REMOVED.increment();
        info!(client = %id, "client removed");
        true
    }

    /// Remove every alive client. Returns the number removed.
    pub fn remove_all(&self) -> usize {
        let ids: Vec<ClientId> = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            slots
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.alive)
                .map(|(i, e)| ClientId::new(i as u32, e.generation))
                .collect()
        };
        ids.into_iter().filter(|&id| self.remove(id)).count()
    }

    /// Number of alive clients.
    pub fn alive_count(&self) -> usize {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.entries.iter().filter(|e| e.alive).count()
    }
}
