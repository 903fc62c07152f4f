//! Continuous playback scheduler.
//!
//! One self-rescheduling task per (controller, channel) streams fixed-size
//! batches of 100 ms pulse frames to the paired app. The app drains one
//! frame per 100 ms, so a batch buys `batch_size × 100` ms of output; the
//! task sleeps `buffer_ratio` of that window minus the measured send
//! latency, keeping the app's buffer near its depletion point without
//! letting it grow. Each sleep is computed from the iteration that just
//! ran — a fixed-interval timer would drift against real send latency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{Channel, FRAME_MS};
use crate::ws::Broker;

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_BUFFER_RATIO: f64 = 0.9;

/// Floor for the delay between sends.
const MIN_WAIT_MS: u64 = 10;

struct PlayStats {
    cursor: usize,
    send_count: u64,
    elapsed_total: Duration,
    last_send_start: Option<Instant>,
}

struct PlaybackShared {
    controller_id: Uuid,
    channel: Channel,
    waveforms: Vec<String>,
    batch_size: usize,
    buffer_ratio: f64,
    /// `batch_size × 100` ms, fixed for the lifetime of the state.
    duration_ms: u64,
    active: AtomicBool,
    stats: Mutex<PlayStats>,
}

impl PlaybackShared {
    /// Advance the cursor modulo the waveform list and return one batch.
    fn next_batch(&self) -> Vec<String> {
        let mut stats = self.stats.lock().unwrap();
        let mut batch = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            batch.push(self.waveforms[stats.cursor % self.waveforms.len()].clone());
            stats.cursor = (stats.cursor + 1) % self.waveforms.len();
        }
        batch
    }

    fn record_send(&self, started: Instant, elapsed: Duration) {
        let mut stats = self.stats.lock().unwrap();
        stats.send_count += 1;
        stats.elapsed_total += elapsed;
        stats.last_send_start = Some(started);
    }
}

struct PlaybackHandle {
    shared: Arc<PlaybackShared>,
    task: JoinHandle<()>,
}

impl PlaybackHandle {
    /// Deactivate and cancel the pending wake-up. No send starts after
    /// this returns; one already past its start keeps going.
    fn cancel(&self) {
        self.shared.active.store(false, Ordering::Release);
        self.task.abort();
    }

    fn status(&self) -> PlaybackStatus {
        let shared = &self.shared;
        let stats = shared.stats.lock().unwrap();
        let elapsed_total_ms = stats.elapsed_total.as_millis() as u64;
        PlaybackStatus {
            waveform_count: shared.waveforms.len(),
            batch_size: shared.batch_size,
            buffer_ratio: shared.buffer_ratio,
            playback_duration_ms: shared.duration_ms,
            active: shared.active.load(Ordering::Acquire),
            send_count: stats.send_count,
            elapsed_total_ms,
            average_elapsed_ms: if stats.send_count > 0 {
                elapsed_total_ms as f64 / stats.send_count as f64
            } else {
                0.0
            },
        }
    }
}

/// Read-only snapshot of one playback state.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStatus {
    pub waveform_count: usize,
    pub batch_size: usize,
    pub buffer_ratio: f64,
    pub playback_duration_ms: u64,
    pub active: bool,
    pub send_count: u64,
    pub elapsed_total_ms: u64,
    pub average_elapsed_ms: f64,
}

pub struct PlaybackScheduler {
    states: DashMap<(Uuid, Channel), PlaybackHandle>,
    broker: Arc<Broker>,
}

impl PlaybackScheduler {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            states: DashMap::new(),
            broker,
        }
    }

    /// Begin (or restart) continuous playback for one channel. An existing
    /// state for the key is cancelled first and its statistics discarded.
    pub fn start(
        self: &Arc<Self>,
        controller_id: Uuid,
        channel: Channel,
        waveforms: Vec<String>,
        batch_size: usize,
        buffer_ratio: f64,
    ) -> bool {
        if !self.broker.is_paired(controller_id) {
            debug!(controller_id = %controller_id, "playback refused: not paired");
            return false;
        }
        if waveforms.is_empty() {
            return false;
        }
        let batch_size = batch_size.max(1);
        let buffer_ratio = if (0.5..=1.0).contains(&buffer_ratio) {
            buffer_ratio
        } else {
            DEFAULT_BUFFER_RATIO
        };

        let shared = Arc::new(PlaybackShared {
            controller_id,
            channel,
            waveforms,
            batch_size,
            buffer_ratio,
            duration_ms: batch_size as u64 * FRAME_MS,
            active: AtomicBool::new(true),
            stats: Mutex::new(PlayStats {
                cursor: 0,
                send_count: 0,
                elapsed_total: Duration::ZERO,
                last_send_start: None,
            }),
        });

        let task = tokio::spawn(run(Arc::clone(self), Arc::clone(&shared)));
        if let Some(old) = self
            .states
            .insert((controller_id, channel), PlaybackHandle { shared, task })
        {
            old.cancel();
        }
        debug!(
            controller_id = %controller_id,
            channel = %channel,
            batch_size,
            buffer_ratio,
            "playback started"
        );
        true
    }

    /// Stop one channel's playback and clear the app's queued frames.
    /// Returns false when no state exists.
    pub fn stop(&self, controller_id: Uuid, channel: Channel) -> bool {
        let Some((_, handle)) = self.states.remove(&(controller_id, channel)) else {
            return false;
        };
        handle.cancel();
        let status = handle.status();
        if status.send_count > 0 {
            debug!(
                controller_id = %controller_id,
                channel = %channel,
                sends = status.send_count,
                average_ms = status.average_elapsed_ms,
                "playback stopped"
            );
        }
        self.broker.send_clear(controller_id, channel);
        true
    }

    /// Cancel both channels for a departing controller.
    pub fn stop_all(&self, controller_id: Uuid) {
        for channel in Channel::BOTH {
            self.stop(controller_id, channel);
        }
    }

    pub fn query(&self, controller_id: Uuid, channel: Channel) -> Option<PlaybackStatus> {
        self.states
            .get(&(controller_id, channel))
            .map(|handle| handle.status())
    }

    /// Server shutdown: cancel every state.
    pub fn shutdown(&self) {
        let keys: Vec<(Uuid, Channel)> = self.states.iter().map(|e| *e.key()).collect();
        for (controller_id, channel) in keys {
            self.stop(controller_id, channel);
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// The send cycle. Single-shot sleeps, each derived from the latency of
/// the send that just completed.
async fn run(scheduler: Arc<PlaybackScheduler>, shared: Arc<PlaybackShared>) {
    loop {
        if !shared.active.load(Ordering::Acquire) {
            return;
        }
        let started = Instant::now();
        let batch = shared.next_batch();
        let sent = scheduler
            .broker
            .send_waveform(shared.controller_id, shared.channel, &batch);
        if !sent {
            warn!(
                controller_id = %shared.controller_id,
                channel = %shared.channel,
                "waveform send failed, stopping playback"
            );
            shared.active.store(false, Ordering::Release);
            scheduler.stop(shared.controller_id, shared.channel);
            return;
        }
        let elapsed = started.elapsed();
        shared.record_send(started, elapsed);

        let target_ms =
            shared.duration_ms as f64 * shared.buffer_ratio - elapsed.as_secs_f64() * 1000.0;
        if target_ms < 0.0 {
            debug!(
                controller_id = %shared.controller_id,
                channel = %shared.channel,
                deficit_ms = -target_ms,
                "send latency exceeds the playback window"
            );
        }
        let wait_ms = target_ms.max(MIN_WAIT_MS as f64);
        tokio::time::sleep(Duration::from_secs_f64(wait_ms / 1000.0)).await;
    }
}
