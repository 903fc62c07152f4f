//! Background lifecycle tasks.
//!
//! 1. **Stale-session sweep** — every five minutes, drops device sessions
//!    with no activity inside the configured TTL. Independent of the two
//!    per-session timers.
//!
//! 2. **Heartbeat emitter** — sends the periodic `heartbeat` frame to
//!    every connected endpoint at the configured interval.

use std::sync::Arc;
use std::time::Duration;

use crate::state::AppState;

/// Cadence of the stale-session sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Spawn the periodic stale-session sweep.
pub fn spawn_sweeper(state: &Arc<AppState>) {
    let sessions = Arc::clone(&state.sessions);
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await; // the immediate first tick
        loop {
            interval.tick().await;
            sessions.sweep();
        }
    });
    state.register_background(task);
}

/// Spawn the heartbeat emitter.
pub fn spawn_heartbeat(state: &Arc<AppState>) {
    let broker = Arc::clone(&state.broker);
    let every = state.config.heartbeat_interval;
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            broker.heartbeat_tick();
        }
    });
    state.register_background(task);
}
