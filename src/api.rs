//! Outbound API — the synchronous surface the agent-facing layer calls.
//!
//! Every call that can fail for business reasons (unknown controller, not
//! paired) reports through its return value; nothing here panics across
//! the boundary. Operations that act on a device refresh the matching
//! session's activity stamp.

use tracing::{info, warn};
use uuid::Uuid;

use crate::playback::{PlaybackStatus, DEFAULT_BATCH_SIZE, DEFAULT_BUFFER_RATIO};
use crate::protocol::{self, Channel, StrengthMode};
use crate::state::AppState;

/// Vendor download page the QR code embeds; the app recognizes the
/// `#DGLAB-SOCKET#` fragment and dials the trailing WebSocket URL.
const QR_TEMPLATE: &str = "https://www.dungeon-lab.com/app-download.php#DGLAB-SOCKET#";

impl AppState {
    /// Register a synthetic controller endpoint and return its id. The
    /// caller pairs the id with a device session record.
    pub fn create_controller(&self) -> Uuid {
        let controller_id = self.broker.create_controller();
        info!(controller_id = %controller_id, "controller created");
        controller_id
    }

    /// Compose the URL the app scans to reach this controller. The
    /// configured public IP wins over the caller-supplied host.
    pub fn qr_url(&self, controller_id: Uuid, host: &str) -> String {
        let host = self.config.public_ip.as_deref().unwrap_or(host);
        format!(
            "{QR_TEMPLATE}ws://{host}:{port}/{controller_id}",
            port = self.config.port
        )
    }

    /// Adjust one channel's strength on the paired app.
    pub fn send_strength(
        &self,
        controller_id: Uuid,
        channel: Channel,
        mode: StrengthMode,
        value: u8,
    ) -> bool {
        let sent = self.broker.send_strength(controller_id, channel, mode, value);
        if sent {
            self.sessions.touch_by_client(controller_id);
        }
        sent
    }

    /// Send one batch of pulse frames. The caller is responsible for
    /// frame validity (16 hex characters each) and a non-empty list.
    pub fn send_waveform(&self, controller_id: Uuid, channel: Channel, frames: &[String]) -> bool {
        let sent = self.broker.send_waveform(controller_id, channel, frames);
        if sent {
            self.sessions.touch_by_client(controller_id);
        }
        sent
    }

    /// Drop the app's queued frames for one channel.
    pub fn clear_waveform(&self, controller_id: Uuid, channel: Channel) -> bool {
        let sent = self.broker.send_clear(controller_id, channel);
        if sent {
            self.sessions.touch_by_client(controller_id);
        }
        sent
    }

    /// Begin (or restart) continuous playback. Frames are validated here
    /// because playback holds on to them for its whole lifetime.
    pub fn start_continuous_playback(
        &self,
        controller_id: Uuid,
        channel: Channel,
        waveforms: Vec<String>,
        batch_size: Option<usize>,
        buffer_ratio: Option<f64>,
    ) -> bool {
        if waveforms.is_empty() {
            return false;
        }
        if !waveforms.iter().all(|f| protocol::is_hex_frame(f)) {
            warn!(controller_id = %controller_id, "playback refused: malformed pulse frame");
            return false;
        }
        let started = self.playback.start(
            controller_id,
            channel,
            waveforms,
            batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            buffer_ratio.unwrap_or(DEFAULT_BUFFER_RATIO),
        );
        if started {
            self.sessions.touch_by_client(controller_id);
        }
        started
    }

    /// Stop one channel's continuous playback. False when none is active.
    pub fn stop_continuous_playback(&self, controller_id: Uuid, channel: Channel) -> bool {
        let stopped = self.playback.stop(controller_id, channel);
        if stopped {
            self.sessions.touch_by_client(controller_id);
        }
        stopped
    }

    pub fn playback_status(&self, controller_id: Uuid, channel: Channel) -> Option<PlaybackStatus> {
        self.playback.query(controller_id, channel)
    }

    /// Tear a controller down: stop playback on both channels, break the
    /// pairing (the app learns via `209`), drop the registry entry and let
    /// the session enter its reconnection window.
    pub fn disconnect_controller(&self, controller_id: Uuid) -> bool {
        self.playback.stop_all(controller_id);
        self.broker.remove_controller(controller_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::{code, kind, Envelope, Event, HANDSHAKE};
    use crate::registry::Outbound;
    use crate::session::ConnectionUpdate;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn test_config() -> Config {
        Config {
            port: 3323,
            public_ip: None,
            sse_path: "/sse".into(),
            post_path: "/message".into(),
            rpc_path: None,
            waveform_store_path: None,
            heartbeat_interval: Duration::from_secs(30),
            stale_device_timeout: Duration::from_secs(3600),
            connection_timeout: Duration::from_secs(3),
            reconnection_timeout: Duration::from_secs(3),
            log_level: String::new(),
        }
    }

    struct Rig {
        state: Arc<AppState>,
        device_id: Uuid,
        controller: Uuid,
        app_rx: UnboundedReceiver<Outbound>,
    }

    fn rig() -> Rig {
        let state = AppState::new(test_config());
        let session = state.sessions.create_session();
        let controller = state.create_controller();
        state.sessions.update_connection_state(
            session.device_id,
            ConnectionUpdate {
                connected: Some(true),
                client_id: Some(Some(controller)),
                ..Default::default()
            },
        );

        let (tx, mut app_rx) = mpsc::unbounded_channel();
        let app = state.broker.register_socket(tx);
        let _ = app_rx.try_recv();
        let env = Envelope::new(
            kind::BIND,
            controller.to_string(),
            app.to_string(),
            HANDSHAKE,
        );
        state.broker.dispatch_inbound(app, &env.to_json().unwrap());
        let _ = app_rx.try_recv();

        Rig {
            state,
            device_id: session.device_id,
            controller,
            app_rx,
        }
    }

    fn payloads(rx: &mut UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(text) = item {
                out.push(Envelope::parse(&text).unwrap().message);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn strength_commands_reach_the_app() {
        let mut rig = rig();
        assert!(rig
            .state
            .send_strength(rig.controller, Channel::A, StrengthMode::Set, 80));
        assert!(rig
            .state
            .send_strength(rig.controller, Channel::B, StrengthMode::Increase, 250));
        assert_eq!(
            payloads(&mut rig.app_rx),
            vec!["strength-1+2+80", "strength-2+1+200"]
        );

        // No pair, no delivery.
        let stranger = rig.state.create_controller();
        assert!(!rig
            .state
            .send_strength(stranger, Channel::A, StrengthMode::Set, 10));
    }

    #[tokio::test(start_paused = true)]
    async fn waveform_and_clear_commands_reach_the_app() {
        let mut rig = rig();
        let frames = vec!["0a0a0a0a0a0a0a0a".to_owned()];
        assert!(rig.state.send_waveform(rig.controller, Channel::A, &frames));
        assert!(rig.state.clear_waveform(rig.controller, Channel::A));
        assert_eq!(
            payloads(&mut rig.app_rx),
            vec![r#"pulse-A:["0a0a0a0a0a0a0a0a"]"#, "clear-1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn playback_start_validates_frames() {
        let rig = rig();
        assert!(!rig
            .state
            .start_continuous_playback(rig.controller, Channel::A, vec![], None, None));
        assert!(!rig.state.start_continuous_playback(
            rig.controller,
            Channel::A,
            vec!["not-hex".into()],
            None,
            None
        ));
        assert!(rig.state.start_continuous_playback(
            rig.controller,
            Channel::A,
            vec!["0000000000000001".into()],
            None,
            None
        ));
        let status = rig
            .state
            .playback_status(rig.controller, Channel::A)
            .unwrap();
        assert_eq!(status.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(status.buffer_ratio, DEFAULT_BUFFER_RATIO);

        assert!(rig.state.stop_continuous_playback(rig.controller, Channel::A));
        assert!(!rig.state.stop_continuous_playback(rig.controller, Channel::A));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_controller_runs_the_full_cascade() {
        let mut rig = rig();
        let mut events = rig.state.subscribe();
        assert!(rig.state.start_continuous_playback(
            rig.controller,
            Channel::A,
            vec!["0000000000000001".into()],
            None,
            None
        ));
        assert!(rig.state.start_continuous_playback(
            rig.controller,
            Channel::B,
            vec!["0000000000000002".into()],
            None,
            None
        ));

        assert!(rig.state.disconnect_controller(rig.controller));
        assert!(!rig.state.disconnect_controller(rig.controller));

        assert!(rig.state.playback.is_empty());
        assert!(payloads(&mut rig.app_rx)
            .iter()
            .any(|m| m == code::PEER_GONE));

        // Bound session enters the reconnection window instead of dying.
        let snap = rig.state.sessions.get(rig.device_id).unwrap();
        assert!(!snap.connected);
        assert!(snap.bound_to_app);
        assert!(snap.reconnect_remaining.is_some());

        let mut controller_disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if let Event::ControllerDisconnected {
                controller_id,
                session_preserved,
            } = event
            {
                assert_eq!(controller_id, rig.controller);
                assert!(session_preserved);
                controller_disconnects += 1;
            }
        }
        assert_eq!(controller_disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn qr_url_embeds_host_port_and_controller() {
        let rig = rig();
        let url = rig.state.qr_url(rig.controller, "192.168.1.20");
        assert_eq!(
            url,
            format!(
                "https://www.dungeon-lab.com/app-download.php#DGLAB-SOCKET#ws://192.168.1.20:3323/{}",
                rig.controller
            )
        );

        let mut config = test_config();
        config.public_ip = Some("203.0.113.7".into());
        let state = AppState::new(config);
        let controller = state.create_controller();
        let url = state.qr_url(controller, "10.0.0.1");
        assert!(url.contains("ws://203.0.113.7:3323/"));
    }

    #[tokio::test(start_paused = true)]
    async fn api_calls_refresh_session_activity() {
        let rig = rig();
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(rig
            .state
            .send_strength(rig.controller, Channel::A, StrengthMode::Set, 10));
        let snap = rig.state.sessions.get(rig.device_id).unwrap();
        assert!(snap.idle < Duration::from_secs(1));
    }
}
