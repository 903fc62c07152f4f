//! WebSocket broker — the heart of dglabd.
//!
//! Flow per connection:
//! 1. Accept WS upgrade, mint a client id, enroll it with role `unknown`
//! 2. Send the id-assignment frame so the peer learns its id
//! 3. Spawn a writer task draining the outbound channel
//! 4. Read loop: dispatch each text frame (handshake, telemetry, forward)
//! 5. On close/error: cascade through the pairing relation and observers
//!
//! The broker mutates the registry only with its lock released before any
//! observer fires, and it never awaits while dispatching, so forwarded
//! frames keep their inbound order.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{
    self, code, kind, Channel, Envelope, StrengthMode, StrengthReport, ASSIGN_ID, HANDSHAKE,
};
use crate::registry::{ClientRegistry, Outbound, OutboundSender, PairError, Role};
use crate::state::AppState;

/// Inbound frames past this size are answered with `405` and dropped.
const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Lifecycle callbacks the broker surfaces. The session store (and the
/// playback teardown path) sit behind this interface; the broker never
/// sees their concrete types.
pub trait BrokerObserver: Send + Sync {
    /// A bind handshake completed (`Some`) or a pairing dissolved (`None`).
    fn bind_change(&self, controller_id: Uuid, app_id: Option<Uuid>);
    /// The app reported strengths and limits.
    fn strength_update(&self, controller_id: Uuid, report: StrengthReport);
    /// The app reported a feedback button press.
    fn feedback(&self, controller_id: Uuid, index: u8);
    /// A controller endpoint left the registry.
    fn controller_disconnect(&self, controller_id: Uuid);
    /// An app endpoint left the registry.
    fn app_disconnect(&self, app_id: Uuid);
}

pub struct Broker {
    registry: Arc<ClientRegistry>,
    observer: OnceCell<Arc<dyn BrokerObserver>>,
}

impl Broker {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            observer: OnceCell::new(),
        }
    }

    /// Install the lifecycle observer. Later calls are ignored.
    pub fn set_observer(&self, observer: Arc<dyn BrokerObserver>) {
        let _ = self.observer.set(observer);
    }

    fn notify(&self, f: impl FnOnce(&dyn BrokerObserver)) {
        if let Some(observer) = self.observer.get() {
            f(observer.as_ref());
        }
    }

    // ── Enrollment ──────────────────────────────────────────

    /// Enroll a freshly upgraded socket and send it its assigned id.
    pub fn register_socket(&self, tx: OutboundSender) -> Uuid {
        let id = self.registry.insert_socket(tx);
        let assign = Envelope::new(kind::BIND, id.to_string(), "", ASSIGN_ID);
        self.registry.send(id, &assign);
        id
    }

    /// Enroll a synthetic controller for the agent layer. It has no
    /// socket; frames the app directs at it are absorbed by the registry.
    pub fn create_controller(&self) -> Uuid {
        self.registry.insert_synthetic()
    }

    pub fn is_paired(&self, id: Uuid) -> bool {
        self.registry.peer_of(id).is_some()
    }

    // ── Outbound command path ───────────────────────────────

    fn send_to_app(&self, controller_id: Uuid, payload: String) -> bool {
        let Some(app_id) = self.registry.peer_of(controller_id) else {
            return false;
        };
        let env = Envelope::new(
            kind::MSG,
            controller_id.to_string(),
            app_id.to_string(),
            payload,
        );
        self.registry.send(app_id, &env)
    }

    pub fn send_strength(
        &self,
        controller_id: Uuid,
        channel: Channel,
        mode: StrengthMode,
        value: u8,
    ) -> bool {
        self.send_to_app(controller_id, protocol::strength_command(channel, mode, value))
    }

    pub fn send_waveform(&self, controller_id: Uuid, channel: Channel, frames: &[String]) -> bool {
        self.send_to_app(controller_id, protocol::pulse_command(channel, frames))
    }

    pub fn send_clear(&self, controller_id: Uuid, channel: Channel) -> bool {
        self.send_to_app(controller_id, protocol::clear_command(channel))
    }

    /// Emit one round of heartbeats. Synthetic entries absorb theirs.
    pub fn heartbeat_tick(&self) {
        let endpoints = self.registry.endpoints();
        for (id, peer) in &endpoints {
            let env = Envelope::new(
                kind::HEARTBEAT,
                id.to_string(),
                peer.map(|p| p.to_string()).unwrap_or_default(),
                code::OK,
            );
            self.registry.send(*id, &env);
        }
        debug!(count = endpoints.len(), "heartbeat tick");
    }

    // ── Inbound dispatch ────────────────────────────────────

    /// Handle one inbound text frame from `sender`.
    pub fn dispatch_inbound(&self, sender: Uuid, raw: &str) {
        if raw.len() > MAX_FRAME_BYTES {
            warn!(client_id = %sender, len = raw.len(), "oversize frame dropped");
            self.reply_code(sender, kind::ERROR, code::OVERSIZE);
            return;
        }
        let Some(env) = Envelope::parse(raw) else {
            warn!(client_id = %sender, "undecodable frame dropped");
            self.reply_code(sender, kind::ERROR, code::BAD_JSON);
            return;
        };

        match env.kind.as_str() {
            kind::BIND if env.message == HANDSHAKE => self.handle_handshake(sender, &env),
            kind::HEARTBEAT => self.registry.touch(sender),
            kind::MSG => self.handle_msg(sender, &env, raw),
            _ => {
                // Unrecognized types travel to the peer untouched.
                if let Some(peer) = self.forward_target(sender, &env) {
                    self.forward_raw(sender, peer, &env, raw);
                }
            }
        }
    }

    /// The pairing handshake: `bind` carrying `DGLAB` with both ids set.
    /// Either side of the future pair may deliver it.
    fn handle_handshake(&self, sender: Uuid, env: &Envelope) {
        let controller_id = Uuid::parse_str(&env.client_id).ok();
        let app_id = Uuid::parse_str(&env.target_id).ok();
        let (Some(controller_id), Some(app_id)) = (controller_id, app_id) else {
            self.reply_bind(sender, env, code::TARGET_MISSING);
            return;
        };

        match self.registry.pair(controller_id, app_id) {
            Err(PairError::UnknownEndpoint) => {
                self.reply_bind(sender, env, code::TARGET_MISSING);
            }
            Err(PairError::AlreadyPaired) => {
                self.reply_bind(sender, env, code::ALREADY_BOUND);
            }
            Ok(()) => {
                let ok = Envelope::new(
                    kind::BIND,
                    controller_id.to_string(),
                    app_id.to_string(),
                    code::OK,
                );
                self.registry.send(controller_id, &ok);
                self.registry.send(app_id, &ok);
                info!(
                    controller_id = %controller_id,
                    app_id = %app_id,
                    "pairing established"
                );
                self.notify(|o| o.bind_change(controller_id, Some(app_id)));
            }
        }
    }

    /// `msg` frames: surface telemetry to the observers, then forward the
    /// original text to the peer.
    fn handle_msg(&self, sender: Uuid, env: &Envelope, raw: &str) {
        let Some(peer) = self.forward_target(sender, env) else {
            return;
        };

        if self.registry.role_of(sender) == Some(Role::App) {
            if let Some(report) = protocol::parse_strength_report(&env.message) {
                self.notify(|o| o.strength_update(peer, report));
            } else if let Some(index) = protocol::parse_feedback(&env.message) {
                self.notify(|o| o.feedback(peer, index));
            }
        }

        self.forward_raw(sender, peer, env, raw);
    }

    /// Forward a frame's original text, telling the sender when the
    /// recipient can no longer take writes.
    fn forward_raw(&self, sender: Uuid, peer: Uuid, env: &Envelope, raw: &str) {
        if !self.registry.send_raw(peer, raw.to_owned()) {
            self.reply_echo(sender, env, code::RECIPIENT_OFFLINE);
        }
    }

    /// Validate a forwarding frame and resolve its destination, answering
    /// the sender with the appropriate code when it cannot be delivered.
    fn forward_target(&self, sender: Uuid, env: &Envelope) -> Option<Uuid> {
        if Uuid::parse_str(&env.client_id).ok() != Some(sender) {
            self.reply_echo(sender, env, code::RECIPIENT_OFFLINE);
            return None;
        }
        let Some(peer) = self.registry.peer_of(sender) else {
            self.reply_echo(sender, env, code::NOT_PAIRED);
            return None;
        };
        if Uuid::parse_str(&env.target_id).ok() != Some(peer) {
            self.reply_echo(sender, env, code::RECIPIENT_OFFLINE);
            return None;
        }
        Some(peer)
    }

    // ── Replies ─────────────────────────────────────────────

    fn reply_code(&self, to: Uuid, kind_: &str, reply: &str) {
        let target = self
            .registry
            .peer_of(to)
            .map(|p| p.to_string())
            .unwrap_or_default();
        let env = Envelope::new(kind_, to.to_string(), target, reply);
        self.registry.send(to, &env);
    }

    /// Bind replies echo the ids the handshake named.
    fn reply_bind(&self, to: Uuid, env: &Envelope, reply: &str) {
        let out = Envelope::new(
            kind::BIND,
            env.client_id.clone(),
            env.target_id.clone(),
            reply,
        );
        self.registry.send(to, &out);
    }

    /// Echo the offending frame's type and ids back with a reply code.
    fn reply_echo(&self, to: Uuid, env: &Envelope, reply: &str) {
        let out = Envelope::new(
            &env.kind,
            env.client_id.clone(),
            env.target_id.clone(),
            reply,
        );
        self.registry.send(to, &out);
    }

    // ── Close cascade ───────────────────────────────────────

    /// An endpoint closed or errored. Cascade per its role.
    pub fn handle_close(&self, id: Uuid) {
        let Some(removed) = self.registry.remove(id) else {
            return;
        };
        match removed.role {
            Role::App => {
                if let Some(controller_id) = removed.peer {
                    self.send_break(controller_id, controller_id, id);
                    self.notify(|o| o.bind_change(controller_id, None));
                }
                info!(app_id = %id, "app endpoint closed");
                self.notify(|o| o.app_disconnect(id));
            }
            Role::Controller => {
                if let Some(app_id) = removed.peer {
                    self.send_break(app_id, id, app_id);
                    self.notify(|o| o.bind_change(id, None));
                }
                info!(controller_id = %id, "controller endpoint closed");
                self.notify(|o| o.controller_disconnect(id));
            }
            Role::Unknown => {
                debug!(client_id = %id, "unbound endpoint closed");
            }
        }
    }

    /// Agent-initiated controller teardown. Same cascade as a socket
    /// close; refuses ids that are not controllers.
    pub fn remove_controller(&self, controller_id: Uuid) -> bool {
        if self.registry.role_of(controller_id) != Some(Role::Controller) {
            return false;
        }
        self.handle_close(controller_id);
        true
    }

    fn send_break(&self, to: Uuid, controller_id: Uuid, app_id: Uuid) {
        let env = Envelope::new(
            kind::BREAK,
            controller_id.to_string(),
            app_id.to_string(),
            code::PEER_GONE,
        );
        self.registry.send(to, &env);
    }
}

// ═══════════════════════════════════════════════════════════════
// Axum surface
// ═══════════════════════════════════════════════════════════════

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/", get(ws_handler))
        .route("/{target}", get(ws_target_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}

/// GET / — upgrade to WebSocket.
async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.broker.clone()))
}

/// GET /{target} — upgrade for an app dialing a QR URL. The path segment
/// names the controller the app intends to pair with; it matters to the
/// app's own handshake, not to the broker.
async fn ws_target_handler(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    debug!(target = %target, "upgrade with target path");
    ws.on_upgrade(move |socket| handle_socket(socket, state.broker.clone()))
}

/// Per-connection loop: writer task + inbound dispatch.
async fn handle_socket(socket: WebSocket, broker: Arc<Broker>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let client_id = broker.register_socket(tx);
    info!(client_id = %client_id, "websocket client connected");

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => broker.dispatch_inbound(client_id, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => { /* binary/ping/pong ignored; axum answers pings */ }
            Err(e) => {
                debug!(client_id = %client_id, "websocket recv error: {e}");
                break;
            }
        }
    }

    broker.handle_close(client_id);
    writer.abort();
    info!(client_id = %client_id, "websocket client gone");
}
