//! Connected clients and what each of them subscribed to.
//!
//! Sessions live in a `DashMap` because connect/disconnect/subscribe
//! callbacks arrive from transport tasks while the notifier is iterating.
//! The notifier never iterates the map directly: `subscribers_of` copies the
//! matching ids out first, so no shard lock is held across a notify call.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info};

use crate::control::{ControlArbiter, ControlDenied};
use crate::gatt::{CharacteristicId, ClientId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSession {
    pub subscriptions: HashSet<CharacteristicId>,
    /// Mirrors the arbiter's slot; only the arbiter syncs it.
    pub holds_control: bool,
}

pub struct SessionRegistry {
    sessions: DashMap<ClientId, ClientSession>,
    arbiter: Arc<ControlArbiter>,
}

impl SessionRegistry {
    pub fn new(arbiter: Arc<ControlArbiter>) -> Self {
        Self {
            sessions: DashMap::new(),
            arbiter,
        }
    }

    pub fn arbiter(&self) -> &Arc<ControlArbiter> {
        &self.arbiter
    }

    /// Track a new client. Returns false if it was already tracked.
    pub fn on_connect(&self, client: &ClientId) -> bool {
        let mut created = false;
        self.sessions.entry(client.clone()).or_insert_with(|| {
            created = true;
            ClientSession::default()
        });
        if created {
            info!("Client connected: {} ({} total)", client, self.sessions.len());
        }
        created
    }

    /// Forget a client. Disconnecting releases control if it held it.
    pub fn on_disconnect(&self, client: &ClientId) -> Option<ClientSession> {
        let removed = self.sessions.remove(client).map(|(_, session)| session);
        if self.arbiter.release(client) {
            info!("Client {} disconnected while in control, control released", client);
        }
        if removed.is_some() {
            info!("Client disconnected: {} ({} left)", client, self.sessions.len());
        }
        removed
    }

    /// Returns false when the client is unknown (e.g. it raced a disconnect).
    pub fn set_subscribed(&self, client: &ClientId, characteristic: CharacteristicId, enabled: bool) -> bool {
        match self.sessions.get_mut(client) {
            Some(mut session) => {
                if enabled {
                    session.subscriptions.insert(characteristic);
                } else {
                    session.subscriptions.remove(&characteristic);
                }
                debug!(
                    "{} {} {:?}",
                    client,
                    if enabled { "subscribed to" } else { "unsubscribed from" },
                    characteristic
                );
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, client: &ClientId, characteristic: CharacteristicId) -> bool {
        self.sessions
            .get(client)
            .is_some_and(|s| s.subscriptions.contains(&characteristic))
    }

    /// Snapshot of the clients currently subscribed to `characteristic`.
    pub fn subscribers_of(&self, characteristic: CharacteristicId) -> Vec<ClientId> {
        self.sessions
            .iter()
            .filter(|entry| entry.subscriptions.contains(&characteristic))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Recompute the client's control bit from the arbiter's slot. The slot
    /// is read under the entry's lock, so whichever sync for a client runs
    /// last sees the final slot and the two agree once transitions settle.
    /// Returns false when the client is unknown.
    pub(crate) fn sync_holds_control(&self, client: &ClientId) -> bool {
        match self.sessions.get_mut(client) {
            Some(mut session) => {
                session.holds_control = self.arbiter.is_held_by(client);
                true
            }
            None => false,
        }
    }

    pub fn holds_control(&self, client: &ClientId) -> bool {
        self.sessions.get(client).is_some_and(|s| s.holds_control)
    }

    pub fn request_control(&self, client: &ClientId) -> Result<(), ControlDenied> {
        self.arbiter.request_control(client, self)
    }

    pub fn reset_control(&self) -> Option<ClientId> {
        self.arbiter.reset(self)
    }

    pub fn contains(&self, client: &ClientId) -> bool {
        self.sessions.contains_key(client)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Remove every session, releasing control. Returns who was removed.
    pub fn drain(&self) -> Vec<ClientId> {
        let clients = self.clients();
        for client in &clients {
            self.on_disconnect(client);
        }
        clients
    }
}
