//! Concurrent registry of client links
//!
//! Links are keyed by [`ClientKey`] and additionally indexed by client id,
//! which is what forwarding looks up. A client id maps to at most one link.

use crate::flow_control::LinkPhase;
use crate::lane::LinkCommand;
use crate::{BridgeError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Identity of one upstream client link
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey {
    connection_id: String,
    client_id: String,
}

impl ClientKey {
    pub fn new(connection_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            client_id: client_id.into(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection_id, self.client_id)
    }
}

/// Registry-side handle to a running link lane
#[derive(Debug, Clone)]
pub struct LinkHandle {
    key: ClientKey,
    link_id: u64,
    flow_control_address: String,
    commands: mpsc::UnboundedSender<LinkCommand>,
    replenish_pending: Arc<AtomicBool>,
    phase: watch::Receiver<LinkPhase>,
}

impl LinkHandle {
    pub(crate) fn new(
        key: ClientKey,
        link_id: u64,
        flow_control_address: String,
        commands: mpsc::UnboundedSender<LinkCommand>,
        replenish_pending: Arc<AtomicBool>,
        phase: watch::Receiver<LinkPhase>,
    ) -> Self {
        Self {
            key,
            link_id,
            flow_control_address,
            commands,
            replenish_pending,
            phase,
        }
    }

    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn flow_control_address(&self) -> &str {
        &self.flow_control_address
    }

    pub fn phase(&self) -> LinkPhase {
        *self.phase.borrow()
    }

    /// Subscribe to phase changes of this link
    pub fn watch_phase(&self) -> watch::Receiver<LinkPhase> {
        self.phase.clone()
    }

    /// Queue a command; `false` once the lane has exited
    pub(crate) fn send(&self, command: LinkCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Ask the lane to re-read sender credit, coalescing with pending requests
    pub(crate) fn request_replenish(&self) -> bool {
        if self.replenish_pending.swap(true, Ordering::SeqCst) {
            return true;
        }
        self.send(LinkCommand::Replenish)
    }
}

/// Concurrent map of client links
#[derive(Debug, Default)]
pub struct ClientRegistry {
    links: DashMap<ClientKey, LinkHandle>,
    by_client: DashMap<String, ClientKey>,
    next_link_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate_link_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a link, refusing a second link for the same client id
    pub fn reserve(&self, handle: LinkHandle) -> Result<()> {
        // Lock order: by_client before links
        match self.by_client.entry(handle.key.client_id.clone()) {
            Entry::Occupied(existing) => Err(BridgeError::DuplicateLink {
                connection_id: existing.get().connection_id.clone(),
                client_id: handle.key.client_id.clone(),
            }),
            Entry::Vacant(slot) => {
                let key = handle.key.clone();
                self.links.insert(key.clone(), handle);
                slot.insert(key);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &ClientKey) -> Option<LinkHandle> {
        self.links.get(key).map(|entry| entry.value().clone())
    }

    /// Resolve the link forwarding for `client_id`
    pub fn lookup_client(&self, client_id: &str) -> Option<LinkHandle> {
        let key = self.by_client.get(client_id).map(|entry| entry.value().clone())?;
        self.get(&key)
    }

    /// Remove the link registered under `key`, whichever it is
    pub fn remove(&self, key: &ClientKey) -> Option<LinkHandle> {
        let (_, handle) = self.links.remove(key)?;
        self.by_client
            .remove_if(key.client_id(), |_, indexed| indexed == key);
        Some(handle)
    }

    /// Remove the link under `key` only if it is still the one with `link_id`
    pub(crate) fn remove_link(&self, key: &ClientKey, link_id: u64) -> bool {
        if self
            .links
            .remove_if(key, |_, handle| handle.link_id == link_id)
            .is_none()
        {
            return false;
        }
        self.by_client
            .remove_if(key.client_id(), |_, indexed| indexed == key);
        true
    }

    /// Remove every link of one upstream connection
    pub fn remove_connection(&self, connection_id: &str) -> Vec<LinkHandle> {
        let keys: Vec<ClientKey> = self
            .links
            .iter()
            .filter(|entry| entry.key().connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Remove every link
    pub fn drain_all(&self) -> Vec<LinkHandle> {
        let keys: Vec<ClientKey> = self.links.iter().map(|entry| entry.key().clone()).collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    pub fn contains_client(&self, client_id: &str) -> bool {
        self.by_client.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
