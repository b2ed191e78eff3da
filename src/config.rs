//! Engine configuration and fixed instrument dimensions.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Number of drawable tracks.
pub const TRACK_COUNT: usize = 4;
/// Number of effect buses in the rack.
pub const EFFECT_COUNT: usize = 5;
/// Beats in one loop cycle.
pub const LOOP_BEATS: f64 = 32.0;
/// Snap grid columns across the canvas.
pub const GRID_COLUMNS: f64 = 32.0;
/// Slots per pattern bank.
pub const BANK_SLOTS: usize = 4;

/// Tempo used when a pattern carries none, or an unusable one.
pub const DEFAULT_BPM: f64 = 120.0;

/// Loop duration in seconds for a tempo. Non-positive tempos play at the default.
pub fn loop_duration(bpm: f64) -> f64 {
    let bpm = if bpm.is_finite() && bpm > 0.0 { bpm } else { DEFAULT_BPM };
    60.0 / bpm * LOOP_BEATS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: f64,
    /// Drawing width in pixels; x spans one loop.
    pub canvas_width: f64,
    /// Drawing height in pixels; y maps to pitch.
    pub pad_height: f64,
    pub master_gain: f64,
    /// Period of the host's tick driver.
    pub tick_interval_ms: u64,
    /// How far before a loop wrap the next cycle is compiled.
    pub schedule_ahead: f64,
    /// Delay between `play()` and the first loop start.
    pub start_delay: f64,
    pub impulse_seed: u64,
    pub jitter_seed: u64,
    pub max_voices: usize,
    /// Longest master recording kept, in seconds.
    pub max_record_seconds: f64,
    /// Use the older resonance-scaled distortion in front of the export filter.
    pub legacy_export_drive: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sample_rate: 44100.0,
            canvas_width: 750.0,
            pad_height: 100.0,
            master_gain: 0.8,
            tick_interval_ms: 16,
            schedule_ahead: 0.1,
            start_delay: 0.05,
            impulse_seed: 0x5EED_CAFE,
            jitter_seed: 0x7177_E125,
            max_voices: 256,
            max_record_seconds: 600.0,
            legacy_export_drive: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Width of one snap-grid column in pixels.
    pub fn grid_step(&self) -> f64 {
        self.canvas_width / GRID_COLUMNS
    }
}
