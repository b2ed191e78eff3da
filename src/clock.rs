//! Loop clock: where playback is inside the current loop cycle, and where
//! its tempo comes from.
//!
//! Both variants read elapsed time from the audio engine's clock. The
//! external variant additionally follows a 24-ppqn sync stream for tempo
//! and transport.

use serde::Deserialize;
use tracing::debug;

use crate::config::{DEFAULT_BPM, loop_duration};

/// Sync ticks per quarter note.
pub const TICKS_PER_BEAT: u32 = 24;
/// Accepted tick spacing in milliseconds, exclusive on both ends.
pub const MIN_TICK_INTERVAL: f64 = 5.0;
pub const MAX_TICK_INTERVAL: f64 = 100.0;
/// Tempo range reported to the session, exclusive on both ends.
pub const MIN_SYNC_BPM: f64 = 30.0;
pub const MAX_SYNC_BPM: f64 = 300.0;
/// Weight of the running average in the tempo smoother.
const SMOOTHING: f64 = 0.98;

/// What a clock reports from a poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockEvent {
    /// The sync source started or continued playback.
    Start,
    Stop,
    BpmChange(f64),
    /// A new cycle began at `loop_start`.
    LoopWrap { loop_start: f64 },
}

/// Already-decoded messages of an external sync source. Timestamps are in
/// milliseconds on the source's clock.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncMessage {
    Tick { timestamp: f64 },
    Start,
    Continue,
    Stop,
}

// ── Loop position ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LoopClock {
    loop_start: f64,
    bpm: f64,
    playing: bool,
}

impl LoopClock {
    pub fn new(bpm: f64) -> Self {
        LoopClock {
            loop_start: 0.0,
            bpm,
            playing: false,
        }
    }

    pub fn start(&mut self, at: f64) {
        self.loop_start = at;
        self.playing = true;
    }

    pub fn stop(&mut self) {
        self.playing = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn loop_start(&self) -> f64 {
        self.loop_start
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm;
    }

    pub fn loop_duration(&self) -> f64 {
        loop_duration(self.bpm)
    }

    /// Seconds since the current cycle began. Negative before a delayed start.
    pub fn position(&self, now: f64) -> f64 {
        if self.playing { now - self.loop_start } else { 0.0 }
    }

    /// Context time at which the current cycle ends.
    pub fn next_loop_start(&self) -> f64 {
        self.loop_start + self.loop_duration()
    }

    /// Advance to the cycle containing `now`, skipping whole cycles missed
    /// while the host was not polling.
    fn wrap(&mut self, now: f64) -> Option<ClockEvent> {
        let duration = self.loop_duration();
        let elapsed = self.position(now);
        if !self.playing || elapsed < duration {
            return None;
        }
        let cycles = (elapsed / duration).floor();
        if cycles > 1.0 {
            debug!(skipped = cycles - 1.0, "clock caught up after a stall");
        }
        self.loop_start += cycles * duration;
        Some(ClockEvent::LoopWrap {
            loop_start: self.loop_start,
        })
    }
}

impl Default for LoopClock {
    fn default() -> Self {
        Self::new(DEFAULT_BPM)
    }
}

/// A source of loop position, tempo and transport.
pub trait ClockSource: Send {
    fn loop_clock(&self) -> &LoopClock;

    fn loop_clock_mut(&mut self) -> &mut LoopClock;

    /// Called on every driver tick with the audio clock's time.
    fn poll(&mut self, now: f64) -> Vec<ClockEvent>;

    fn is_external(&self) -> bool {
        false
    }

    /// Feed one sync message. Sources without an external input ignore it.
    fn handle(&mut self, _message: SyncMessage) {}

    fn position(&self, now: f64) -> f64 {
        self.loop_clock().position(now)
    }

    fn loop_duration(&self) -> f64 {
        self.loop_clock().loop_duration()
    }

    fn is_playing(&self) -> bool {
        self.loop_clock().is_playing()
    }
}

// ── Internal ────────────────────────────────────────────────

/// Tempo set by the pattern; loop position from the audio clock.
#[derive(Debug, Clone, Default)]
pub struct InternalClock {
    clock: LoopClock,
}

impl InternalClock {
    pub fn new(clock: LoopClock) -> Self {
        InternalClock { clock }
    }
}

impl ClockSource for InternalClock {
    fn loop_clock(&self) -> &LoopClock {
        &self.clock
    }

    fn loop_clock_mut(&mut self) -> &mut LoopClock {
        &mut self.clock
    }

    fn poll(&mut self, now: f64) -> Vec<ClockEvent> {
        self.clock.wrap(now).into_iter().collect()
    }
}

// ── External ────────────────────────────────────────────────

/// Smoothed tempo estimate from a 24-ppqn tick stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TempoTracker {
    last_tick: Option<f64>,
    smoothed: Option<f64>,
    accepted: u32,
}

impl TempoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn smoothed(&self) -> Option<f64> {
        self.smoothed
    }

    /// Forget every sample, as on a start or continue.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed one tick. Returns the smoothed tempo once per quarter note of
    /// accepted ticks, when it lies in the reportable range.
    pub fn tick(&mut self, timestamp: f64) -> Option<f64> {
        let previous = self.last_tick.replace(timestamp)?;
        let interval = timestamp - previous;
        if interval <= MIN_TICK_INTERVAL || interval >= MAX_TICK_INTERVAL {
            debug!(interval, "sync tick rejected");
            return None;
        }

        let instant = 60_000.0 / (interval * TICKS_PER_BEAT as f64);
        let smoothed = match self.smoothed {
            Some(s) => s * SMOOTHING + instant * (1.0 - SMOOTHING),
            None => instant,
        };
        self.smoothed = Some(smoothed);

        self.accepted += 1;
        if self.accepted < TICKS_PER_BEAT {
            return None;
        }
        self.accepted = 0;
        (smoothed > MIN_SYNC_BPM && smoothed < MAX_SYNC_BPM).then_some(smoothed)
    }
}

/// Tempo and transport follow an external sync source.
#[derive(Debug, Clone, Default)]
pub struct ExternalClock {
    clock: LoopClock,
    tracker: TempoTracker,
    pending: Vec<ClockEvent>,
}

impl ExternalClock {
    pub fn new(clock: LoopClock) -> Self {
        ExternalClock {
            clock,
            tracker: TempoTracker::new(),
            pending: Vec::new(),
        }
    }

    pub fn tracker(&self) -> &TempoTracker {
        &self.tracker
    }
}

impl ClockSource for ExternalClock {
    fn loop_clock(&self) -> &LoopClock {
        &self.clock
    }

    fn loop_clock_mut(&mut self) -> &mut LoopClock {
        &mut self.clock
    }

    fn poll(&mut self, now: f64) -> Vec<ClockEvent> {
        let mut events = std::mem::take(&mut self.pending);
        events.extend(self.clock.wrap(now));
        events
    }

    fn is_external(&self) -> bool {
        true
    }

    fn handle(&mut self, message: SyncMessage) {
        match message {
            SyncMessage::Tick { timestamp } => {
                // The loop length follows at the next cycle boundary.
                if let Some(bpm) = self.tracker.tick(timestamp) {
                    debug!(bpm, "external tempo");
                    self.pending.push(ClockEvent::BpmChange(bpm));
                }
            }
            SyncMessage::Start | SyncMessage::Continue => {
                self.tracker.reset();
                self.pending.push(ClockEvent::Start);
            }
            SyncMessage::Stop => self.pending.push(ClockEvent::Stop),
        }
    }
}
