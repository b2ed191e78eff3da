//! Live gestures: the voice that follows the pointer while a stroke is drawn.
//!
//! A gesture bypasses the compiler but shares its pitch mapping, detune rule
//! and grain shape, and plays through the same track strip and sends.

use tracing::debug;

use crate::compiler::{CompileContext, GRAIN_LENGTH, VoiceEvent, detune, detuned, grain_envelope, voice_count};
use crate::dsp::param::Automation;
use crate::dsp::voice::Voice;
use crate::engine::{AudioEngine, VoiceId};
use crate::pattern::{Brush, Pen, Point, Track};

/// Envelope rise when a gesture starts.
pub const GESTURE_ATTACK: f64 = 0.01;
/// Time constant of the pitch glide on pointer moves.
pub const PITCH_GLIDE: f64 = 0.02;
/// Time constant of the envelope release.
pub const RELEASE_TIME_CONSTANT: f64 = 0.05;
/// Oscillators stop this long after release.
pub const RELEASE_LINGER: f64 = 0.1;
/// Minimum spacing of dragged particle grains.
pub const GRAIN_INTERVAL: f64 = 0.016;

/// Strip gain below which a gesture stays silent.
const AUDIBLE_GAIN: f64 = 0.01;

#[derive(Debug, Clone, Copy)]
struct Gesture {
    track: usize,
    pen: Pen,
    /// Sustained voice; particles gestures have none.
    voice: Option<VoiceId>,
}

#[derive(Debug, Default)]
pub struct VoiceManager {
    gesture: Option<Gesture>,
    last_grain: Option<f64>,
}

impl VoiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.gesture.is_some()
    }

    /// Voice of the running gesture, if it is still sounding.
    pub fn voice(&self) -> Option<VoiceId> {
        self.gesture.and_then(|g| g.voice)
    }

    /// Pointer down. Any earlier gesture is released first. A particles pen
    /// fires one grain; every other pen opens a sustained voice.
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        &mut self,
        engine: &mut AudioEngine,
        ctx: &CompileContext,
        track_index: usize,
        track: &Track,
        strip_gain: f64,
        pen: Pen,
        x: f64,
        y: f64,
    ) -> Option<VoiceId> {
        self.end(engine);
        if strip_gain < AUDIBLE_GAIN {
            return None;
        }

        if pen.brush == Brush::Particles {
            self.gesture = Some(Gesture {
                track: track_index,
                pen,
                voice: None,
            });
            return self.grain(engine, ctx, track_index, track, y);
        }

        let base = target_pitch(ctx, pen.brush, track.stroke_tail(), y);
        let frequencies: Vec<f64> = (0..voice_count(pen.brush, pen.chord))
            .map(|i| detuned(base, detune(pen.brush, pen.chord, i, x)))
            .collect();

        let now = engine.current_time();
        let mut voice = Voice::sustained(
            track_index,
            pen.brush,
            track.wave,
            &frequencies,
            now,
            engine.sample_rate(),
        );
        voice.envelope.set_value_at(0.0, now);
        voice
            .envelope
            .linear_ramp_to(pen.brush.plateau(), now + GESTURE_ATTACK);

        let id = engine.register(voice)?;
        debug!(track = track_index, brush = ?pen.brush, oscillators = frequencies.len(), "gesture started");
        self.gesture = Some(Gesture {
            track: track_index,
            pen,
            voice: Some(id),
        });
        Some(id)
    }

    /// Pointer move. Sustained voices glide to the new pitch; particles fire
    /// a grain at most once per `GRAIN_INTERVAL`.
    pub fn update(
        &mut self,
        engine: &mut AudioEngine,
        ctx: &CompileContext,
        track: &Track,
        x: f64,
        y: f64,
    ) -> Option<VoiceId> {
        let gesture = self.gesture?;
        let now = engine.current_time();

        let Some(id) = gesture.voice else {
            if self.last_grain.is_some_and(|last| now - last < GRAIN_INTERVAL) {
                return None;
            }
            return self.grain(engine, ctx, gesture.track, track, y);
        };

        let base = target_pitch(ctx, gesture.pen.brush, track.stroke_tail(), y);
        let Some(voice) = engine.voice_mut(id) else {
            // Already finished and unregistered.
            self.gesture = None;
            return None;
        };
        for i in 0..voice.oscillator_count() {
            let target = detuned(base, detune(gesture.pen.brush, gesture.pen.chord, i, x));
            if let Some(frequency) = voice.frequency_mut(i) {
                frequency.glide_to(target, now, PITCH_GLIDE);
            }
        }
        Some(id)
    }

    /// Pointer up. Fades the voice out and stops it shortly after. Returns
    /// false when no gesture was running.
    pub fn end(&mut self, engine: &mut AudioEngine) -> bool {
        let Some(gesture) = self.gesture.take() else {
            return false;
        };
        if let Some(id) = gesture.voice {
            let now = engine.current_time();
            if let Some(voice) = engine.voice_mut(id) {
                voice.envelope.glide_to(0.0, now, RELEASE_TIME_CONSTANT);
            }
            engine.release(id, now + RELEASE_LINGER);
        }
        true
    }

    /// Forget the gesture without touching the engine, after a global stop.
    pub fn reset(&mut self) {
        self.gesture = None;
        self.last_grain = None;
    }

    fn grain(
        &mut self,
        engine: &mut AudioEngine,
        ctx: &CompileContext,
        track_index: usize,
        track: &Track,
        y: f64,
    ) -> Option<VoiceId> {
        let now = engine.current_time();
        self.last_grain = Some(now);
        let event = VoiceEvent {
            track: track_index,
            brush: Brush::Particles,
            waveform: track.wave,
            start: now,
            stop: now + GRAIN_LENGTH,
            frequency: vec![Automation::SetValue {
                time: now,
                value: ctx.pitch_at(y),
            }],
            gain: grain_envelope(now),
        };
        engine.schedule(&event)
    }
}

/// Pitch under the pointer. The fractal brush lifts it by the jitter of the
/// stroke's last point, as the compiled stroke will be.
fn target_pitch(ctx: &CompileContext, brush: Brush, tail: Option<&Point>, y: f64) -> f64 {
    let y = match (brush, tail) {
        (Brush::Fractal, Some(point)) => y + point.lift(ctx.chaos),
        _ => y,
    };
    ctx.pitch_at(y)
}
