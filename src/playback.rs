//! Gapless playback scheduling for synthesized speech.
//!
//! Chunks are scheduled back-to-back on the output clock: each enqueue starts
//! at `max(next_start, now)` and advances `next_start` by the chunk duration,
//! so consecutive chunks play with no gap and no overlap. `interrupt()` stops
//! everything and resets the clock origin to the current time. Muting gates
//! only the output gain; scheduling keeps running while silenced.

use crate::pcm::AudioBuffer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Receives audio at its scheduled start time. A production implementation
/// pushes to an output device; tests record what played and when.
pub trait PlaybackSink: Send + Sync + 'static {
    fn play(&self, frame: ScheduledFrame);
}

/// One chunk of synthesized speech, delivered when its slot begins.
#[derive(Debug, Clone)]
pub struct ScheduledFrame {
    pub buffer: AudioBuffer,
    pub start: Instant,
}

struct SchedState {
    next_start: Instant,
    gain: f32,
    next_id: u64,
    active: HashMap<u64, JoinHandle<()>>,
}

/// Gapless playback queue with hard-stop interruption.
pub struct PlaybackScheduler {
    sink: Arc<dyn PlaybackSink>,
    state: Arc<Mutex<SchedState>>,
}

impl PlaybackScheduler {
    pub fn new(sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            state: Arc::new(Mutex::new(SchedState {
                next_start: Instant::now(),
                gain: 1.0,
                next_id: 0,
                active: HashMap::new(),
            })),
        }
    }

    /// Schedule a decoded chunk to start at `max(next_start, now)` and track
    /// it until it finishes. Must be called from within a tokio runtime.
    pub fn enqueue(&self, buffer: AudioBuffer) {
        let dur = buffer.duration();
        if dur.is_zero() {
            return;
        }

        let mut st = self.state.lock().unwrap();
        let now = Instant::now();
        let start = if st.next_start > now { st.next_start } else { now };
        st.next_start = start + dur;

        let id = st.next_id;
        st.next_id += 1;

        let sink = self.sink.clone();
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            sleep_until(start).await;

            let gain = state.lock().unwrap().gain;
            let mut buffer = buffer;
            if gain != 1.0 {
                for channel in &mut buffer.channels {
                    for sample in channel.iter_mut() {
                        *sample *= gain;
                    }
                }
            }
            sink.play(ScheduledFrame { buffer, start });

            sleep_until(start + dur).await;
            state.lock().unwrap().active.remove(&id);
        });
        st.active.insert(id, handle);
    }

    /// Stop every active or scheduled source immediately and reset the
    /// schedule origin to the current clock time, so the next enqueue never
    /// lands in the past.
    pub fn interrupt(&self) {
        let mut st = self.state.lock().unwrap();
        let stopped = st.active.len();
        for (_, handle) in st.active.drain() {
            handle.abort();
        }
        st.next_start = Instant::now();
        if stopped > 0 {
            debug!("playback interrupted, {} source(s) stopped", stopped);
        }
    }

    /// Gate the output gain. Scheduling continues while muted; frames are
    /// delivered silenced.
    pub fn set_muted(&self, muted: bool) {
        self.state.lock().unwrap().gain = if muted { 0.0 } else { 1.0 };
    }

    /// Number of sources currently playing or scheduled.
    pub fn active_sources(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// The instant the next enqueued chunk would start at the earliest.
    pub fn next_start(&self) -> Instant {
        let st = self.state.lock().unwrap();
        let now = Instant::now();
        if st.next_start > now {
            st.next_start
        } else {
            now
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        let mut st = self.state.lock().unwrap();
        for (_, handle) in st.active.drain() {
            handle.abort();
        }
    }
}
