//! Device session store.
//!
//! Owns every logical device record: lifecycle timers, alias index,
//! telemetry, and the reconnection window. All operations are atomic with
//! respect to the store mutex; transports are closed and events published
//! only after the lock is released. Timers are one-shot tasks whose handles
//! live in the owning record — replacing or dropping a handle cancels the
//! prior schedule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::BridgeError;
use crate::protocol::{Channel, Event, SessionEnd, MAX_STRENGTH};
use crate::registry::{Outbound, OutboundSender};

/// Cancelable one-shot schedule. Cancel is idempotent and dropping the
/// handle cancels too, so a record leaving the store never leaks a timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Partial update applied by `update_connection_state`. Outer `Option` is
/// "change this field at all"; inner values are the new state.
#[derive(Default)]
pub struct ConnectionUpdate {
    pub connected: Option<bool>,
    pub bound_to_app: Option<bool>,
    pub client_id: Option<Option<Uuid>>,
    pub target_id: Option<Option<Uuid>>,
    pub transport: Option<Option<OutboundSender>>,
}

struct SessionRecord {
    device_id: Uuid,
    alias: Option<String>,
    client_id: Option<Uuid>,
    target_id: Option<Uuid>,
    connected: bool,
    bound_to_app: bool,
    strength_a: u8,
    strength_b: u8,
    limit_a: u8,
    limit_b: u8,
    feedback_a: Option<u8>,
    feedback_b: Option<u8>,
    created_at: DateTime<Utc>,
    last_active: Instant,
    disconnected_at: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    transport: Option<OutboundSender>,
    connection_timer: Option<TimerHandle>,
    reconnection_timer: Option<TimerHandle>,
}

impl SessionRecord {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device_id: self.device_id,
            alias: self.alias.clone(),
            client_id: self.client_id,
            target_id: self.target_id,
            connected: self.connected,
            bound_to_app: self.bound_to_app,
            strength_a: self.strength_a,
            strength_b: self.strength_b,
            limit_a: self.limit_a,
            limit_b: self.limit_b,
            feedback_a: self.feedback_a,
            feedback_b: self.feedback_b,
            created_at: self.created_at,
            idle: self.last_active.elapsed(),
            disconnected_for: self.disconnected_at.map(|t| t.elapsed()),
            reconnect_remaining: self
                .reconnect_deadline
                .map(|d| d.saturating_duration_since(Instant::now())),
        }
    }
}

/// Point-in-time copy of one device session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub device_id: Uuid,
    pub alias: Option<String>,
    pub client_id: Option<Uuid>,
    pub target_id: Option<Uuid>,
    pub connected: bool,
    pub bound_to_app: bool,
    pub strength_a: u8,
    pub strength_b: u8,
    pub limit_a: u8,
    pub limit_b: u8,
    pub feedback_a: Option<u8>,
    pub feedback_b: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub idle: Duration,
    pub disconnected_for: Option<Duration>,
    pub reconnect_remaining: Option<Duration>,
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<Uuid, SessionRecord>,
    /// Case-folded alias → device id.
    aliases: HashMap<String, Uuid>,
}

pub struct SessionStore {
    inner: Mutex<StoreInner>,
    connection_timeout: Duration,
    reconnection_timeout: Duration,
    stale_after: Duration,
    event_tx: broadcast::Sender<Event>,
}

impl SessionStore {
    pub fn new(
        connection_timeout: Duration,
        reconnection_timeout: Duration,
        stale_after: Duration,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            connection_timeout,
            reconnection_timeout,
            stale_after,
            event_tx,
        }
    }

    fn publish(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    // ── Creation and lookup ─────────────────────────────────

    /// Mint a fresh device session. The connection-idle timer starts now:
    /// if no bind handshake lands inside the window, the session is
    /// deleted.
    pub fn create_session(self: &Arc<Self>) -> SessionSnapshot {
        let device_id = Uuid::new_v4();
        let store = Arc::clone(self);
        let after = self.connection_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            store.expire_if_unbound(device_id);
        });

        let record = SessionRecord {
            device_id,
            alias: None,
            client_id: None,
            target_id: None,
            connected: false,
            bound_to_app: false,
            strength_a: 0,
            strength_b: 0,
            limit_a: MAX_STRENGTH,
            limit_b: MAX_STRENGTH,
            feedback_a: None,
            feedback_b: None,
            created_at: Utc::now(),
            last_active: Instant::now(),
            disconnected_at: None,
            reconnect_deadline: None,
            transport: None,
            connection_timer: Some(TimerHandle::new(timer)),
            reconnection_timer: None,
        };
        let snapshot = record.snapshot();
        self.inner.lock().unwrap().sessions.insert(device_id, record);
        info!(device_id = %device_id, "device session created");
        snapshot
    }

    /// Fetch a session, sweeping it first if it went stale.
    pub fn get(&self, device_id: Uuid) -> Option<SessionSnapshot> {
        let (snapshot, removed) = {
            let mut inner = self.inner.lock().unwrap();
            let fresh = inner
                .sessions
                .get(&device_id)
                .map(|rec| (rec.last_active.elapsed() <= self.stale_after).then(|| rec.snapshot()));
            match fresh {
                Some(Some(snapshot)) => (Some(snapshot), None),
                Some(None) => (None, remove_record(&mut inner, device_id)),
                None => (None, None),
            }
        };
        self.finish_removal(removed, SessionEnd::Stale);
        snapshot
    }

    pub fn get_by_client_id(&self, client_id: Uuid) -> Option<SessionSnapshot> {
        let device_id = {
            let inner = self.inner.lock().unwrap();
            inner
                .sessions
                .values()
                .find(|rec| rec.client_id == Some(client_id))
                .map(|rec| rec.device_id)
        };
        device_id.and_then(|id| self.get(id))
    }

    pub fn find_by_alias(&self, alias: &str) -> Option<SessionSnapshot> {
        let folded = alias.to_lowercase();
        let device_id = self.inner.lock().unwrap().aliases.get(&folded).copied();
        device_id.and_then(|id| self.get(id))
    }

    /// Device ids whose paired app is `app_id`.
    pub fn ids_by_target(&self, app_id: Uuid) -> Vec<Uuid> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|rec| rec.target_id == Some(app_id))
            .map(|rec| rec.device_id)
            .collect()
    }

    // ── Mutation ────────────────────────────────────────────

    /// Set or change the human alias. Aliases are unique across live
    /// sessions under case folding.
    pub fn set_alias(&self, device_id: Uuid, alias: &str) -> Result<(), BridgeError> {
        if alias.is_empty() {
            return Err(BridgeError::InvalidArgument("alias must not be empty".into()));
        }
        let folded = alias.to_lowercase();
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        match inner.aliases.get(&folded) {
            Some(owner) if *owner != device_id => {
                return Err(BridgeError::AliasTaken(alias.to_owned()))
            }
            _ => {}
        }
        let Some(rec) = inner.sessions.get_mut(&device_id) else {
            return Err(BridgeError::UnknownDevice(device_id));
        };
        if let Some(old) = rec.alias.take() {
            inner.aliases.remove(&old.to_lowercase());
        }
        rec.alias = Some(alias.to_owned());
        rec.last_active = Instant::now();
        inner.aliases.insert(folded, device_id);
        Ok(())
    }

    /// Merge a partial connection-state update and refresh last-active.
    pub fn update_connection_state(&self, device_id: Uuid, update: ConnectionUpdate) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(rec) = inner.sessions.get_mut(&device_id) else {
            return false;
        };
        if let Some(connected) = update.connected {
            rec.connected = connected;
        }
        if let Some(bound) = update.bound_to_app {
            rec.bound_to_app = bound;
        }
        if let Some(client_id) = update.client_id {
            rec.client_id = client_id;
        }
        if let Some(target_id) = update.target_id {
            rec.target_id = target_id;
        }
        if let Some(transport) = update.transport {
            rec.transport = transport;
        }
        rec.last_active = Instant::now();
        true
    }

    /// Store reported strengths/limits, clamped so that
    /// 0 ≤ strength ≤ limit ≤ 200 holds on both channels.
    pub fn update_strength(&self, device_id: Uuid, a: u8, b: u8, limit_a: u8, limit_b: u8) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(rec) = inner.sessions.get_mut(&device_id) else {
            return false;
        };
        rec.limit_a = limit_a.min(MAX_STRENGTH);
        rec.limit_b = limit_b.min(MAX_STRENGTH);
        rec.strength_a = a.min(rec.limit_a);
        rec.strength_b = b.min(rec.limit_b);
        rec.last_active = Instant::now();
        true
    }

    /// Retain the most recent feedback index per channel.
    pub fn update_feedback(&self, device_id: Uuid, channel: Channel, index: u8) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(rec) = inner.sessions.get_mut(&device_id) else {
            return false;
        };
        match channel {
            Channel::A => rec.feedback_a = Some(index),
            Channel::B => rec.feedback_b = Some(index),
        }
        rec.last_active = Instant::now();
        true
    }

    /// First successful bind handshake: the connection-idle window closes
    /// for good and the session counts as bound from here on.
    pub fn on_app_bound(&self, device_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(rec) = inner.sessions.get_mut(&device_id) else {
            return false;
        };
        rec.connection_timer = None;
        rec.bound_to_app = true;
        rec.connected = true;
        rec.last_active = Instant::now();
        true
    }

    /// Endpoint loss for this device. Unbound sessions are deleted on the
    /// spot; bound ones enter the reconnection window. Returns whether the
    /// session was preserved.
    pub fn handle_disconnection(self: &Arc<Self>, device_id: Uuid) -> bool {
        let (preserved, removed) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(rec) = inner.sessions.get_mut(&device_id) else {
                return false;
            };
            rec.connection_timer = None;
            if !rec.bound_to_app {
                let removed = remove_record(&mut inner, device_id);
                (false, removed)
            } else {
                rec.connected = false;
                rec.disconnected_at = Some(Instant::now());
                rec.transport = None;
                rec.reconnect_deadline = Some(Instant::now() + self.reconnection_timeout);

                let store = Arc::clone(self);
                let after = self.reconnection_timeout;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    store.expire_if_disconnected(device_id);
                });
                rec.reconnection_timer = Some(TimerHandle::new(timer));
                (true, None)
            }
        };
        self.finish_removal(removed, SessionEnd::NeverBound);
        if preserved {
            info!(device_id = %device_id, "device disconnected, reconnection window open");
        }
        preserved
    }

    /// The app came back inside the window: restore the live state.
    pub fn handle_reconnection(
        &self,
        device_id: Uuid,
        transport: Option<OutboundSender>,
        client_id: Uuid,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(rec) = inner.sessions.get_mut(&device_id) else {
            return false;
        };
        rec.reconnection_timer = None;
        rec.reconnect_deadline = None;
        rec.disconnected_at = None;
        rec.connected = true;
        rec.client_id = Some(client_id);
        rec.transport = transport;
        rec.last_active = Instant::now();
        info!(device_id = %device_id, "device reconnected");
        true
    }

    /// Cancel a pending reconnection window without a transport change.
    pub fn clear_reconnection_state(&self, device_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(rec) = inner.sessions.get_mut(&device_id) else {
            return false;
        };
        rec.reconnection_timer = None;
        rec.reconnect_deadline = None;
        rec.disconnected_at = None;
        rec.connected = true;
        true
    }

    pub fn get_reconnection_remaining(&self, device_id: Uuid) -> Option<Duration> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&device_id)
            .and_then(|rec| rec.reconnect_deadline)
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn touch(&self, device_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.get_mut(&device_id) {
            Some(rec) => {
                rec.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn touch_by_client(&self, client_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .sessions
            .values_mut()
            .find(|rec| rec.client_id == Some(client_id))
        {
            Some(rec) => {
                rec.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    // ── Removal ─────────────────────────────────────────────

    /// Explicit delete. Cancels timers, closes the transport best-effort,
    /// drops the alias. Idempotent: deleting twice returns false.
    pub fn delete(&self, device_id: Uuid) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            remove_record(&mut inner, device_id)
        };
        let deleted = removed.is_some();
        self.finish_removal(removed, SessionEnd::Explicit);
        deleted
    }

    /// Snapshot every live session, sweeping stale ones first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.sweep();
        self.inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .map(SessionRecord::snapshot)
            .collect()
    }

    /// Drop every session idle past the TTL. Returns how many went.
    pub fn sweep(&self) -> usize {
        let removed: Vec<SessionRecord> = {
            let mut inner = self.inner.lock().unwrap();
            let stale: Vec<Uuid> = inner
                .sessions
                .values()
                .filter(|rec| rec.last_active.elapsed() > self.stale_after)
                .map(|rec| rec.device_id)
                .collect();
            stale
                .into_iter()
                .filter_map(|id| remove_record(&mut inner, id))
                .collect()
        };
        let count = removed.len();
        for record in removed {
            self.finish_removal(Some(record), SessionEnd::Stale);
        }
        if count > 0 {
            debug!(count, "swept stale device sessions");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shutdown path: drop everything without publishing events. Dropping
    /// the records cancels their timers; transports get a close.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        for rec in inner.sessions.values() {
            if let Some(tx) = &rec.transport {
                let _ = tx.send(Outbound::Close);
            }
        }
        inner.sessions.clear();
        inner.aliases.clear();
    }

    // ── Timer callbacks ─────────────────────────────────────

    fn expire_if_unbound(&self, device_id: Uuid) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let expired = inner
                .sessions
                .get(&device_id)
                .is_some_and(|rec| !rec.bound_to_app);
            if expired {
                remove_record(&mut inner, device_id)
            } else {
                None
            }
        };
        if removed.is_some() {
            info!(device_id = %device_id, "connection window expired, session deleted");
        }
        self.finish_removal(removed, SessionEnd::NeverBound);
    }

    fn expire_if_disconnected(&self, device_id: Uuid) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let expired = inner
                .sessions
                .get(&device_id)
                .is_some_and(|rec| !rec.connected);
            if expired {
                remove_record(&mut inner, device_id)
            } else {
                None
            }
        };
        if removed.is_some() {
            info!(device_id = %device_id, "reconnection window expired, session deleted");
        }
        self.finish_removal(removed, SessionEnd::ReconnectExpired);
    }

    /// Post-removal work done outside the lock: close the transport and
    /// tell subscribers. Dropping the record cancels its timers.
    fn finish_removal(&self, removed: Option<SessionRecord>, reason: SessionEnd) {
        if let Some(record) = removed {
            if let Some(tx) = &record.transport {
                let _ = tx.send(Outbound::Close);
            }
            self.publish(Event::SessionDeleted {
                device_id: record.device_id,
                reason,
            });
        }
    }
}

fn remove_record(inner: &mut StoreInner, device_id: Uuid) -> Option<SessionRecord> {
    let record = inner.sessions.remove(&device_id)?;
    if let Some(alias) = &record.alias {
        inner.aliases.remove(&alias.to_lowercase());
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::{advance, sleep};

    fn store(connection: u64, reconnection: u64, stale: u64) -> Arc<SessionStore> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(SessionStore::new(
            Duration::from_secs(connection),
            Duration::from_secs(reconnection),
            Duration::from_secs(stale),
            event_tx,
        ))
    }

    fn bind(store: &Arc<SessionStore>, device_id: Uuid) -> Uuid {
        let client_id = Uuid::new_v4();
        store.update_connection_state(
            device_id,
            ConnectionUpdate {
                connected: Some(true),
                client_id: Some(Some(client_id)),
                target_id: Some(Some(Uuid::new_v4())),
                ..Default::default()
            },
        );
        store.on_app_bound(device_id);
        client_id
    }

    #[tokio::test(start_paused = true)]
    async fn unbound_session_expires_after_connection_window() {
        let store = store(3, 3, 3600);
        let session = store.create_session();

        sleep(Duration::from_secs(2)).await;
        assert!(store.get(session.device_id).is_some());

        sleep(Duration::from_secs(2)).await;
        assert!(store.get(session.device_id).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bound_session_survives_connection_window() {
        let store = store(3, 3, 3600);
        let session = store.create_session();
        bind(&store, session.device_id);

        sleep(Duration::from_secs(10)).await;
        let got = store.get(session.device_id).unwrap();
        assert!(got.bound_to_app);
        assert!(got.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_and_reconnect_preserves_state() {
        let store = store(3, 3, 3600);
        let session = store.create_session();
        bind(&store, session.device_id);
        store.set_alias(session.device_id, "ash").unwrap();
        store.update_strength(session.device_id, 100, 150, 200, 200);

        let preserved = store.handle_disconnection(session.device_id);
        assert!(preserved);
        let got = store.get(session.device_id).unwrap();
        assert!(!got.connected);
        assert!(got.bound_to_app);
        assert!(got.disconnected_for.is_some());
        assert!(store.get_reconnection_remaining(session.device_id).is_some());

        sleep(Duration::from_secs(1)).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let new_client = Uuid::new_v4();
        assert!(store.handle_reconnection(session.device_id, Some(tx), new_client));

        let got = store.get(session.device_id).unwrap();
        assert!(got.connected);
        assert!(got.disconnected_for.is_none());
        assert_eq!(got.client_id, Some(new_client));
        assert_eq!(got.alias.as_deref(), Some("ash"));
        assert_eq!((got.strength_a, got.strength_b), (100, 150));

        // No timer left to fire.
        sleep(Duration::from_secs(10)).await;
        assert!(store.get(session.device_id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnection_window_expiry_deletes_session() {
        let store = store(3, 3, 3600);
        let session = store.create_session();
        bind(&store, session.device_id);

        assert!(store.handle_disconnection(session.device_id));
        sleep(Duration::from_secs(4)).await;
        assert!(store.get(session.device_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unbound_disconnect_deletes_immediately() {
        let store = store(30, 30, 3600);
        let session = store.create_session();
        assert!(!store.handle_disconnection(session.device_id));
        assert!(store.get(session.device_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn alias_unique_under_case_folding() {
        let store = store(30, 30, 3600);
        let one = store.create_session();
        let two = store.create_session();

        store.set_alias(one.device_id, "Ash").unwrap();
        assert!(matches!(
            store.set_alias(two.device_id, "ash"),
            Err(BridgeError::AliasTaken(_))
        ));
        // Re-setting your own alias is fine, as is replacing it.
        store.set_alias(one.device_id, "ASH").unwrap();
        store.set_alias(one.device_id, "ember").unwrap();
        store.set_alias(two.device_id, "ash").unwrap();

        assert_eq!(
            store.find_by_alias("EMBER").unwrap().device_id,
            one.device_id
        );
    }

    #[tokio::test(start_paused = true)]
    async fn alias_frees_up_after_delete() {
        let store = store(30, 30, 3600);
        let one = store.create_session();
        store.set_alias(one.device_id, "ash").unwrap();
        assert!(store.delete(one.device_id));
        assert!(!store.delete(one.device_id));

        let two = store.create_session();
        store.set_alias(two.device_id, "ash").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn strength_updates_clamp_into_range() {
        let store = store(30, 30, 3600);
        let session = store.create_session();

        store.update_strength(session.device_id, 250, 80, 250, 50);
        let got = store.get(session.device_id).unwrap();
        assert_eq!(got.limit_a, 200);
        assert_eq!(got.strength_a, 200);
        assert_eq!(got.limit_b, 50);
        assert_eq!(got.strength_b, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sessions_are_swept() {
        let store = store(3600, 3600, 10);
        let session = store.create_session();
        bind(&store, session.device_id);

        advance(Duration::from_secs(5)).await;
        assert_eq!(store.sweep(), 0);
        store.touch(session.device_id);

        advance(Duration::from_secs(11)).await;
        assert_eq!(store.sweep(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_vanishes_on_get() {
        let store = store(3600, 3600, 10);
        let session = store.create_session();
        bind(&store, session.device_id);

        advance(Duration::from_secs(11)).await;
        assert!(store.get(session.device_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_by_client_id() {
        let store = store(30, 30, 3600);
        let session = store.create_session();
        let client_id = bind(&store, session.device_id);

        assert_eq!(
            store.get_by_client_id(client_id).unwrap().device_id,
            session.device_id
        );
        assert!(store.get_by_client_id(Uuid::new_v4()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn session_deleted_events_carry_reason() {
        let (event_tx, mut event_rx) = broadcast::channel(64);
        let store = Arc::new(SessionStore::new(
            Duration::from_secs(2),
            Duration::from_secs(2),
            Duration::from_secs(3600),
            event_tx,
        ));
        let session = store.create_session();
        sleep(Duration::from_secs(3)).await;

        match event_rx.recv().await.unwrap() {
            Event::SessionDeleted { device_id, reason } => {
                assert_eq!(device_id, session.device_id);
                assert_eq!(reason, SessionEnd::NeverBound);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
