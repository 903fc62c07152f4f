//! Client registry and pairing relation.
//!
//! One aggregate, one lock: connected endpoints keyed by client id, plus
//! the bidirectional controller⇄app relation. The broker is the only
//! mutator of the relation, and every multi-entry invariant check happens
//! under the registry mutex. Nothing here awaits; outbound writes push into
//! an unbounded per-connection channel and report success as a bool.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::protocol::Envelope;

/// Instruction for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(String),
    Close,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    App,
    Unknown,
}

/// Transport half of a registry entry. Controllers created by the agent
/// layer are synthetic: they have no socket and writes to them are
/// silently discarded.
enum Transport {
    Socket(OutboundSender),
    Synthetic,
}

struct ClientEntry {
    role: Role,
    peer: Option<Uuid>,
    last_active: Instant,
    transport: Transport,
}

/// Why a pair could not be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairError {
    /// One of the endpoints is not in the registry.
    UnknownEndpoint,
    /// One of the endpoints is already in a relation.
    AlreadyPaired,
}

/// Endpoint removed from the registry, with what the close path needs.
pub struct RemovedClient {
    pub role: Role,
    pub peer: Option<Uuid>,
}

#[derive(Default)]
struct RegistryInner {
    clients: HashMap<Uuid, ClientEntry>,
    by_controller: HashMap<Uuid, Uuid>,
    by_app: HashMap<Uuid, Uuid>,
}

impl RegistryInner {
    fn in_relation(&self, id: Uuid) -> bool {
        self.by_controller.contains_key(&id) || self.by_app.contains_key(&id)
    }

    /// Dissolve whatever relation `id` participates in. Returns the peer.
    fn dissolve(&mut self, id: Uuid) -> Option<Uuid> {
        let (controller, app) = if let Some(app) = self.by_controller.get(&id) {
            (id, *app)
        } else if let Some(controller) = self.by_app.get(&id) {
            (*controller, id)
        } else {
            return None;
        };
        self.by_controller.remove(&controller);
        self.by_app.remove(&app);
        if let Some(entry) = self.clients.get_mut(&controller) {
            entry.peer = None;
        }
        if let Some(entry) = self.clients.get_mut(&app) {
            entry.peer = None;
        }
        Some(if id == controller { app } else { controller })
    }
}

pub struct ClientRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Enroll a freshly upgraded socket with role `unknown`.
    pub fn insert_socket(&self, tx: OutboundSender) -> Uuid {
        self.insert(Role::Unknown, Transport::Socket(tx))
    }

    /// Enroll a synthetic controller endpoint for the agent layer.
    pub fn insert_synthetic(&self) -> Uuid {
        self.insert(Role::Controller, Transport::Synthetic)
    }

    fn insert(&self, role: Role, transport: Transport) -> Uuid {
        let id = Uuid::new_v4();
        let entry = ClientEntry {
            role,
            peer: None,
            last_active: Instant::now(),
            transport,
        };
        self.inner.lock().unwrap().clients.insert(id, entry);
        id
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.lock().unwrap().clients.contains_key(&id)
    }

    pub fn role_of(&self, id: Uuid) -> Option<Role> {
        self.inner.lock().unwrap().clients.get(&id).map(|e| e.role)
    }

    pub fn peer_of(&self, id: Uuid) -> Option<Uuid> {
        self.inner.lock().unwrap().clients.get(&id).and_then(|e| e.peer)
    }

    /// Refresh an endpoint's last-active stamp (heartbeats).
    pub fn touch(&self, id: Uuid) {
        if let Some(entry) = self.inner.lock().unwrap().clients.get_mut(&id) {
            entry.last_active = Instant::now();
        }
    }

    pub fn idle_for(&self, id: Uuid) -> Option<std::time::Duration> {
        self.inner
            .lock()
            .unwrap()
            .clients
            .get(&id)
            .map(|e| e.last_active.elapsed())
    }

    /// Outbound channel of a socket endpoint; `None` for synthetic entries
    /// and unknown ids.
    pub fn socket_sender(&self, id: Uuid) -> Option<OutboundSender> {
        match self.inner.lock().unwrap().clients.get(&id).map(|e| &e.transport) {
            Some(Transport::Socket(tx)) => Some(tx.clone()),
            _ => None,
        }
    }

    /// Install the controller⇄app relation and assign roles. Both endpoints
    /// must exist and neither may already be in a relation.
    pub fn pair(&self, controller: Uuid, app: Uuid) -> Result<(), PairError> {
        let mut inner = self.inner.lock().unwrap();
        if controller == app
            || !inner.clients.contains_key(&controller)
            || !inner.clients.contains_key(&app)
        {
            return Err(PairError::UnknownEndpoint);
        }
        if inner.in_relation(controller) || inner.in_relation(app) {
            return Err(PairError::AlreadyPaired);
        }
        inner.by_controller.insert(controller, app);
        inner.by_app.insert(app, controller);
        if let Some(entry) = inner.clients.get_mut(&controller) {
            entry.role = Role::Controller;
            entry.peer = Some(app);
        }
        if let Some(entry) = inner.clients.get_mut(&app) {
            entry.role = Role::App;
            entry.peer = Some(controller);
        }
        Ok(())
    }

    /// Dissolve the relation `id` participates in, leaving both entries in
    /// place. Returns the former peer.
    pub fn unpair(&self, id: Uuid) -> Option<Uuid> {
        self.inner.lock().unwrap().dissolve(id)
    }

    /// Remove an endpoint entirely, cascading through the relation.
    pub fn remove(&self, id: Uuid) -> Option<RemovedClient> {
        let mut inner = self.inner.lock().unwrap();
        let peer = inner.dissolve(id);
        inner
            .clients
            .remove(&id)
            .map(|entry| RemovedClient {
                role: entry.role,
                peer: peer.or(entry.peer),
            })
    }

    /// Serialize and push an envelope to one endpoint. Writes to synthetic
    /// entries are discarded and count as delivered.
    pub fn send(&self, to: Uuid, envelope: &Envelope) -> bool {
        let Some(json) = envelope.to_json() else {
            warn!(client_id = %to, "failed to serialize outbound envelope");
            return false;
        };
        self.send_raw(to, json)
    }

    /// Push pre-serialized frame text to one endpoint (forwarding path).
    pub fn send_raw(&self, to: Uuid, text: String) -> bool {
        match self.inner.lock().unwrap().clients.get(&to).map(|e| &e.transport) {
            Some(Transport::Socket(tx)) => tx.send(Outbound::Frame(text)).is_ok(),
            Some(Transport::Synthetic) => true,
            None => false,
        }
    }

    /// Ask a socket endpoint's writer to close. Idempotent, best-effort.
    pub fn send_close(&self, id: Uuid) {
        if let Some(Transport::Socket(tx)) =
            self.inner.lock().unwrap().clients.get(&id).map(|e| &e.transport)
        {
            let _ = tx.send(Outbound::Close);
        }
    }

    /// Snapshot (id, peer) for heartbeat fan-out.
    pub fn endpoints(&self) -> Vec<(Uuid, Option<Uuid>)> {
        self.inner
            .lock()
            .unwrap()
            .clients
            .iter()
            .map(|(id, e)| (*id, e.peer))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every socket and drop all entries and relations (shutdown).
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.clients.values() {
            if let Transport::Socket(tx) = &entry.transport {
                let _ = tx.send(Outbound::Close);
            }
        }
        inner.clients.clear();
        inner.by_controller.clear();
        inner.by_app.clear();
    }
}
