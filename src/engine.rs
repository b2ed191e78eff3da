//! Audio Engine: the live engine context.
//!
//! One `AudioEngine` owns the persistent render graph, the rack and routing
//! state, and the registry of sounding voices. The host pulls audio from it;
//! the session, scheduler and live gestures push voices and parameter
//! changes into it, always timestamped on the engine's own clock.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::compiler::VoiceEvent;
use crate::config::{EngineConfig, TRACK_COUNT};
use crate::dsp::RENDER_QUANTUM;
use crate::dsp::graph::{GraphSpec, RenderGraph};
use crate::dsp::mixer::MeterLevel;
use crate::dsp::recorder::MasterTap;
use crate::dsp::shaper::DriveCurve;
use crate::dsp::voice::Voice;
use crate::error::{EngineError, Result};
use crate::pattern::Brush;
use crate::rack::{EffectKind, Parameter, RackSettings};
use crate::routing::SendMatrix;

/// Registry key of a sounding voice.
pub type VoiceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    /// Created but not yet producing audio; the clock is frozen.
    Suspended,
    Running,
    /// Permanently shut down.
    Closed,
}

/// Drive curve a voice of `brush` plays through at the given morph.
pub fn voice_drive(brush: Brush, morph: f64) -> Option<DriveCurve> {
    (brush == Brush::Fractal).then(|| DriveCurve::fractal_morph(morph))
}

/// Turn a compiled event into a voice. Used by both the live engine and
/// offline export, so both hear the same thing.
pub fn instantiate(event: &VoiceEvent, sample_rate: f64, morph: f64) -> Voice {
    Voice::from_event(event, sample_rate).with_drive(voice_drive(event.brush, morph))
}

pub struct AudioEngine {
    sample_rate: f64,
    max_voices: usize,
    max_record_frames: usize,
    state: ContextState,
    graph: RenderGraph,
    rack: RackSettings,
    matrix: SendMatrix,
    voices: BTreeMap<VoiceId, Voice>,
    next_id: VoiceId,
    /// Frames rendered so far; the context clock.
    frames: u64,
    quantum_l: Vec<f32>,
    quantum_r: Vec<f32>,
    /// Read position inside the last rendered quantum.
    cursor: usize,
}

impl AudioEngine {
    pub fn new(config: &EngineConfig, track_gains: [f64; TRACK_COUNT]) -> Self {
        Self::with_state(config, RackSettings::default(), SendMatrix::new(), track_gains)
    }

    /// An engine whose graph starts at the given rack and routing, with no glide.
    pub fn with_state(
        config: &EngineConfig,
        rack: RackSettings,
        matrix: SendMatrix,
        track_gains: [f64; TRACK_COUNT],
    ) -> Self {
        AudioEngine {
            sample_rate: config.sample_rate,
            max_voices: config.max_voices,
            max_record_frames: (config.max_record_seconds.max(0.0) * config.sample_rate) as usize,
            state: ContextState::Suspended,
            graph: RenderGraph::new(&GraphSpec::live(config), &rack, &matrix, track_gains),
            rack,
            matrix,
            voices: BTreeMap::new(),
            next_id: 0,
            frames: 0,
            quantum_l: vec![0.0; RENDER_QUANTUM],
            quantum_r: vec![0.0; RENDER_QUANTUM],
            cursor: RENDER_QUANTUM,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Context time in seconds. Advances one quantum at a time, only while running.
    pub fn current_time(&self) -> f64 {
        self.frames as f64 / self.sample_rate
    }

    pub fn resume(&mut self) -> Result<()> {
        match self.state {
            ContextState::Closed => Err(EngineError::ContextUnavailable(
                "audio context is closed".to_string(),
            )),
            ContextState::Running => Ok(()),
            ContextState::Suspended => {
                info!("audio context running");
                self.state = ContextState::Running;
                Ok(())
            }
        }
    }

    pub fn suspend(&mut self) {
        if self.state == ContextState::Running {
            self.state = ContextState::Suspended;
        }
    }

    pub fn close(&mut self) {
        self.stop_all();
        self.state = ContextState::Closed;
    }

    pub fn rack(&self) -> &RackSettings {
        &self.rack
    }

    pub fn matrix(&self) -> &SendMatrix {
        &self.matrix
    }

    pub fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    // ── Parameters & routing ────────────────────────────────

    /// Move a knob. The running graph glides to the new value; a morph
    /// change re-patches every sounding fractal voice.
    pub fn set_parameter(&mut self, parameter: Parameter, knob: f64) {
        self.rack.set_knob(parameter, knob);
        let now = self.current_time();
        self.graph
            .apply_parameter(parameter, &self.rack, &self.matrix, now);

        if parameter == Parameter::FractalMorph {
            let drive = voice_drive(Brush::Fractal, self.rack.morph());
            let mut patched = 0;
            for voice in self.voices.values_mut().filter(|v| v.brush == Brush::Fractal) {
                voice.set_drive(drive);
                patched += 1;
            }
            debug!(patched, morph = self.rack.morph(), "fractal voices re-patched");
        }
    }

    pub fn set_route(&mut self, track: usize, effect: EffectKind, active: bool) -> Result<()> {
        self.matrix.set_route(track, effect, active)?;
        let now = self.current_time();
        self.graph
            .apply_routing(&self.matrix, self.rack.stutter_mix(), now);
        Ok(())
    }

    /// Replace the whole rack and routing, gliding every parameter.
    pub fn load_state(&mut self, rack: RackSettings, matrix: SendMatrix) {
        self.matrix = matrix;
        for parameter in Parameter::ALL {
            self.set_parameter(parameter, rack.knob(parameter));
        }
        let now = self.current_time();
        self.graph
            .apply_routing(&self.matrix, self.rack.stutter_mix(), now);
    }

    /// Glide each strip to its solo/mute/volume gain.
    pub fn set_track_levels(&mut self, gains: [f64; TRACK_COUNT]) {
        let now = self.current_time();
        self.graph.set_track_gains(gains, now);
    }

    /// Peak classification of a track's dry bus over the last quantum.
    pub fn meter(&self, track: usize) -> Option<MeterLevel> {
        self.graph.meter(track).map(|m| m.level())
    }

    pub fn meter_peak(&self, track: usize) -> Option<f32> {
        self.graph.meter(track).map(|m| m.peak())
    }

    // ── Recording ───────────────────────────────────────────

    /// Capture the master output from the next quantum on.
    pub fn start_recording(&mut self) {
        self.graph.arm_tap(self.max_record_frames);
        info!(at = self.current_time(), "master recording started");
    }

    /// Stop capturing. `None` if nothing was being recorded.
    pub fn stop_recording(&mut self) -> Option<MasterTap> {
        let tap = self.graph.disarm_tap()?;
        info!(frames = tap.frames(), full = tap.is_full(), "master recording stopped");
        Some(tap)
    }

    pub fn is_recording(&self) -> bool {
        self.graph.tap().is_some()
    }

    // ── Voice registry ──────────────────────────────────────

    /// Instantiate and register a compiled event.
    pub fn schedule(&mut self, event: &VoiceEvent) -> Option<VoiceId> {
        let voice = instantiate(event, self.sample_rate, self.rack.morph());
        self.register(voice)
    }

    /// Register a voice built elsewhere (live gestures).
    pub fn register(&mut self, mut voice: Voice) -> Option<VoiceId> {
        if self.voices.len() >= self.max_voices {
            warn!(limit = self.max_voices, "voice limit reached, dropping voice");
            return None;
        }
        if voice.brush == Brush::Fractal {
            voice.set_drive(voice_drive(Brush::Fractal, self.rack.morph()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.voices.insert(id, voice);
        Some(id)
    }

    pub fn voice_mut(&mut self, id: VoiceId) -> Option<&mut Voice> {
        self.voices.get_mut(&id)
    }

    pub fn is_active(&self, id: VoiceId) -> bool {
        self.voices.contains_key(&id)
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Schedule a voice to stop at `at`. Unknown or finished voices are ignored.
    pub fn release(&mut self, id: VoiceId, at: f64) {
        if let Some(voice) = self.voices.get_mut(&id) {
            voice.stop_at(at);
        }
    }

    /// Force-stop and unregister every voice. Returns how many were sounding.
    pub fn stop_all(&mut self) -> usize {
        let count = self.voices.len();
        self.voices.clear();
        if count > 0 {
            debug!(count, "stopped all voices");
        }
        count
    }

    // ── Rendering ───────────────────────────────────────────

    /// Fill `out_l`/`out_r` with the next frames. Silence, without advancing
    /// the clock, unless the context is running.
    pub fn pull(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let n = out_l.len().min(out_r.len());
        if self.state != ContextState::Running {
            out_l.fill(0.0);
            out_r.fill(0.0);
            return;
        }

        let mut written = 0;
        while written < n {
            if self.cursor == RENDER_QUANTUM {
                self.render_quantum();
            }
            let take = (RENDER_QUANTUM - self.cursor).min(n - written);
            let range = self.cursor..self.cursor + take;
            out_l[written..written + take].copy_from_slice(&self.quantum_l[range.clone()]);
            out_r[written..written + take].copy_from_slice(&self.quantum_r[range]);
            self.cursor += take;
            written += take;
        }
    }

    /// Render `frames` frames into new buffers.
    pub fn pull_frames(&mut self, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        self.pull(&mut left, &mut right);
        (left, right)
    }

    fn render_quantum(&mut self) {
        let time = self.current_time();
        self.graph.render_quantum(
            time,
            self.voices.values_mut(),
            &mut self.quantum_l,
            &mut self.quantum_r,
        );
        self.frames += RENDER_QUANTUM as u64;
        self.cursor = 0;

        let end = self.current_time();
        self.voices.retain(|_, voice| !voice.is_finished(end));
    }
}
