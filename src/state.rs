//! Shared server state — aggregate wiring and the broker observer.
//!
//! `AppState` owns the four aggregates (client registry, broker, session
//! store, playback scheduler) plus the internal event bus. The broker only
//! sees the session store and playback teardown through the
//! `BrokerObserver` interface installed here.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::playback::PlaybackScheduler;
use crate::protocol::{feedback_channel, Event, StrengthReport};
use crate::registry::ClientRegistry;
use crate::session::{ConnectionUpdate, SessionStore};
use crate::ws::{Broker, BrokerObserver};

/// Shared state accessible from all handlers and the embedding agent layer.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ClientRegistry>,
    pub broker: Arc<Broker>,
    pub sessions: Arc<SessionStore>,
    pub playback: Arc<PlaybackScheduler>,
    event_tx: broadcast::Sender<Event>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(4096);

        let registry = Arc::new(ClientRegistry::new());
        let broker = Arc::new(Broker::new(Arc::clone(&registry)));
        let sessions = Arc::new(SessionStore::new(
            config.connection_timeout,
            config.reconnection_timeout,
            config.stale_device_timeout,
            event_tx.clone(),
        ));
        let playback = Arc::new(PlaybackScheduler::new(Arc::clone(&broker)));

        broker.set_observer(Arc::new(CoreObserver {
            registry: Arc::clone(&registry),
            sessions: Arc::clone(&sessions),
            playback: Arc::clone(&playback),
            event_tx: event_tx.clone(),
        }));

        Arc::new(Self {
            config,
            registry,
            broker,
            sessions,
            playback,
            event_tx,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to lifecycle and telemetry events. Lagging receivers miss
    /// events; the bus never blocks the core.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Track a background task so shutdown can stop it in order.
    pub fn register_background(&self, task: JoinHandle<()>) {
        self.background.lock().unwrap().push(task);
    }

    /// Ordered teardown: background tasks (sweep first, then heartbeat),
    /// playback states, transports, stores.
    pub fn shutdown(&self) {
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
        self.playback.shutdown();
        self.registry.close_all();
        self.sessions.clear();
    }
}

/// Routes broker lifecycle callbacks into the session store and playback
/// scheduler, and republishes them on the event bus.
struct CoreObserver {
    registry: Arc<ClientRegistry>,
    sessions: Arc<SessionStore>,
    playback: Arc<PlaybackScheduler>,
    event_tx: broadcast::Sender<Event>,
}

impl CoreObserver {
    fn publish(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }
}

impl BrokerObserver for CoreObserver {
    fn bind_change(&self, controller_id: Uuid, app_id: Option<Uuid>) {
        match app_id {
            Some(app_id) => {
                let Some(session) = self.sessions.get_by_client_id(controller_id) else {
                    debug!(controller_id = %controller_id, "bind for unmanaged controller");
                    return;
                };
                let transport = self.registry.socket_sender(app_id);
                if !session.bound_to_app {
                    self.sessions.update_connection_state(
                        session.device_id,
                        ConnectionUpdate {
                            connected: Some(true),
                            target_id: Some(Some(app_id)),
                            transport: Some(transport),
                            ..Default::default()
                        },
                    );
                    self.sessions.on_app_bound(session.device_id);
                } else if !session.connected {
                    // Re-pair inside the reconnection window.
                    self.sessions
                        .handle_reconnection(session.device_id, transport, controller_id);
                    self.sessions.update_connection_state(
                        session.device_id,
                        ConnectionUpdate {
                            target_id: Some(Some(app_id)),
                            ..Default::default()
                        },
                    );
                } else {
                    // Rebind of a live session refreshes the target.
                    self.sessions.update_connection_state(
                        session.device_id,
                        ConnectionUpdate {
                            target_id: Some(Some(app_id)),
                            transport: Some(transport),
                            ..Default::default()
                        },
                    );
                }
                self.publish(Event::DeviceBound {
                    device_id: session.device_id,
                    controller_id,
                    app_id,
                });
            }
            None => {
                self.playback.stop_all(controller_id);
                // target_id stays as the last-known app so the
                // app-disconnect sweep can still find this session.
                if let Some(session) = self.sessions.get_by_client_id(controller_id) {
                    self.publish(Event::DeviceUnbound {
                        device_id: session.device_id,
                        controller_id,
                    });
                }
            }
        }
    }

    fn strength_update(&self, controller_id: Uuid, report: StrengthReport) {
        if let Some(session) = self.sessions.get_by_client_id(controller_id) {
            self.sessions.update_strength(
                session.device_id,
                report.a,
                report.b,
                report.limit_a,
                report.limit_b,
            );
            self.publish(Event::StrengthChanged {
                device_id: session.device_id,
                report,
            });
        }
    }

    fn feedback(&self, controller_id: Uuid, index: u8) {
        if let Some(session) = self.sessions.get_by_client_id(controller_id) {
            let channel = feedback_channel(index);
            self.sessions.update_feedback(session.device_id, channel, index);
            self.publish(Event::FeedbackReceived {
                device_id: session.device_id,
                channel,
                index,
            });
        }
    }

    fn controller_disconnect(&self, controller_id: Uuid) {
        self.playback.stop_all(controller_id);
        let session_preserved = match self.sessions.get_by_client_id(controller_id) {
            Some(session) => self.sessions.handle_disconnection(session.device_id),
            None => false,
        };
        self.publish(Event::ControllerDisconnected {
            controller_id,
            session_preserved,
        });
    }

    fn app_disconnect(&self, app_id: Uuid) {
        for device_id in self.sessions.ids_by_target(app_id) {
            self.sessions.handle_disconnection(device_id);
        }
        self.publish(Event::AppDisconnected { app_id });
    }
}
