//! Pattern compiler: turns drawn segments into voice events with absolute
//! start/stop times and frequency/gain automation for one loop cycle.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::dsp::oscillator::Waveform;
use crate::dsp::param::Automation;
use crate::pattern::{Brush, ChordType, PatternSettings, Point, Segment, Track};
use crate::pitch::{Scale, harmonize, map_pitch};

// ── Envelope Shapes ─────────────────────────────────────────

/// Fade-in of a sustained voice (seconds).
pub const RAMP_ATTACK: f64 = 0.02;
/// Fade-out after the last breakpoint.
pub const RAMP_RELEASE: f64 = 0.1;
/// Oscillator stop after the last breakpoint.
pub const RAMP_TAIL: f64 = 0.2;

pub const GRAIN_PEAK: f64 = 0.4;
pub const GRAIN_ATTACK: f64 = 0.01;
pub const GRAIN_DECAY: f64 = 0.15;
/// Level the exponential decay aims for; the oscillator stops before it matters.
pub const GRAIN_FLOOR: f64 = 0.01;
pub const GRAIN_LENGTH: f64 = 0.2;

/// Gain automation of a particle grain starting at `t`.
pub fn grain_envelope(t: f64) -> Vec<Automation> {
    vec![
        Automation::SetValue { time: t, value: 0.0 },
        Automation::LinearRamp {
            time: t + GRAIN_ATTACK,
            value: GRAIN_PEAK,
        },
        Automation::ExponentialRamp {
            time: t + GRAIN_DECAY,
            value: GRAIN_FLOOR,
        },
    ]
}

/// Gain automation of a sustained voice between its first and last breakpoint.
pub fn ramp_envelope(plateau: f64, start: f64, end: f64) -> Vec<Automation> {
    vec![
        Automation::SetValue { time: start, value: 0.0 },
        Automation::LinearRamp {
            time: start + RAMP_ATTACK,
            value: plateau,
        },
        Automation::SetValue {
            time: end,
            value: plateau,
        },
        Automation::LinearRamp {
            time: end + RAMP_RELEASE,
            value: 0.0,
        },
    ]
}

// ── Voice Layout ────────────────────────────────────────────

/// Number of xenakis voices per stroke.
pub const XENAKIS_VOICES: usize = 5;

/// Oscillators a brush stroke plays at once.
pub fn voice_count(brush: Brush, chord: ChordType) -> usize {
    match brush {
        Brush::Chord => chord.intervals().len(),
        Brush::Xenakis => XENAKIS_VOICES,
        _ => 1,
    }
}

/// Detune in semitones of voice `index` of a stroke at horizontal position `x`.
///
/// Chord voices sit on the chord intervals. Xenakis voices spread around the
/// drawn pitch with a slow wobble that follows `x`.
pub fn detune(brush: Brush, chord: ChordType, index: usize, x: f64) -> f64 {
    match brush {
        Brush::Chord => chord.intervals().get(index).copied().unwrap_or(0) as f64,
        Brush::Xenakis => {
            let offset = index as f64 - 2.0;
            offset * 0.05 + (x * 0.04 + offset * 1.5).sin() * 0.15
        }
        _ => 0.0,
    }
}

pub fn detuned(frequency: f64, semitones: f64) -> f64 {
    frequency * 2.0_f64.powf(semitones / 12.0)
}

// ── Compiled Events ─────────────────────────────────────────

/// One scheduled note: a single oscillator with its frequency and gain
/// automation, in absolute context seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceEvent {
    pub track: usize,
    pub brush: Brush,
    pub waveform: Waveform,
    pub start: f64,
    pub stop: f64,
    pub frequency: Vec<Automation>,
    pub gain: Vec<Automation>,
}

/// Everything that maps drawn geometry onto one loop cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileContext {
    pub loop_start: f64,
    pub loop_duration: f64,
    pub harmonize: bool,
    pub scale: Scale,
    /// Fractal chaos knob, 0..1.
    pub chaos: f64,
    pub canvas_width: f64,
    pub pad_height: f64,
}

impl CompileContext {
    pub fn new(config: &EngineConfig, settings: &PatternSettings, loop_start: f64, chaos: f64) -> Self {
        CompileContext {
            loop_start,
            loop_duration: crate::config::loop_duration(settings.bpm),
            harmonize: settings.harmonize,
            scale: settings.scale,
            chaos,
            canvas_width: config.canvas_width,
            pad_height: config.pad_height,
        }
    }

    /// Context time of horizontal position `x`, never negative.
    pub fn time_at(&self, x: f64) -> f64 {
        (self.loop_start + x / self.canvas_width * self.loop_duration).max(0.0)
    }

    /// Frequency of vertical position `y`, quantized when harmonizing.
    pub fn pitch_at(&self, y: f64) -> f64 {
        harmonize(map_pitch(y, self.pad_height), self.harmonize, self.scale)
    }

    /// Effective position of a point for `brush`: the fractal brush
    /// distorts it by its frozen jitter.
    pub fn position(&self, point: &Point, brush: Brush) -> (f64, f64) {
        if brush == Brush::Fractal {
            point.perturbed(self.chaos)
        } else {
            (point.x, point.y)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Breakpoint {
    time: f64,
    frequency: f64,
    x: f64,
}

// ── Compilation ─────────────────────────────────────────────

/// Compile one track's segments into voice events for one loop cycle.
pub fn compile(track_index: usize, track: &Track, ctx: &CompileContext) -> Vec<VoiceEvent> {
    let mut events = Vec::new();
    for segment in &track.segments {
        compile_segment(track_index, track.wave, segment, ctx, &mut events);
    }
    events
}

/// Compile every track, in track order.
pub fn compile_all(tracks: &[Track], ctx: &CompileContext) -> Vec<VoiceEvent> {
    tracks
        .iter()
        .enumerate()
        .flat_map(|(i, track)| compile(i, track, ctx))
        .collect()
}

fn compile_segment(
    track: usize,
    waveform: Waveform,
    segment: &Segment,
    ctx: &CompileContext,
    events: &mut Vec<VoiceEvent>,
) {
    let brush = segment.brush;
    let mut points = segment.playable_points();

    if brush == Brush::Particles {
        for point in &points {
            let t = ctx.time_at(point.x);
            events.push(VoiceEvent {
                track,
                brush,
                waveform,
                start: t,
                stop: t + GRAIN_LENGTH,
                frequency: vec![Automation::SetValue {
                    time: t,
                    value: ctx.pitch_at(point.y),
                }],
                gain: grain_envelope(t),
            });
        }
        return;
    }

    if points.len() < 2 {
        return;
    }
    points.sort_by(|a, b| a.x.total_cmp(&b.x));

    let mut breakpoints: Vec<Breakpoint> = points
        .iter()
        .map(|p| {
            let (x, y) = ctx.position(p, brush);
            Breakpoint {
                time: ctx.time_at(x),
                frequency: ctx.pitch_at(y),
                x,
            }
        })
        .collect();
    breakpoints.sort_by(|a, b| a.time.total_cmp(&b.time));

    let (Some(first), Some(last)) = (breakpoints.first(), breakpoints.last()) else {
        return;
    };
    let (start, end) = (first.time, last.time);
    let gain = ramp_envelope(brush.plateau(), start, end);

    for index in 0..voice_count(brush, segment.chord_type) {
        let mut frequency = Vec::with_capacity(breakpoints.len());
        for (i, bp) in breakpoints.iter().enumerate() {
            let value = detuned(bp.frequency, detune(brush, segment.chord_type, index, bp.x));
            frequency.push(if i == 0 {
                Automation::SetValue { time: bp.time, value }
            } else {
                Automation::LinearRamp { time: bp.time, value }
            });
        }
        events.push(VoiceEvent {
            track,
            brush,
            waveform,
            start,
            stop: end + RAMP_TAIL,
            frequency,
            gain: gain.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CompileContext {
        CompileContext {
            loop_start: 0.0,
            loop_duration: 16.0,
            harmonize: false,
            scale: Scale::Major,
            chaos: 0.0,
            canvas_width: 750.0,
            pad_height: 100.0,
        }
    }

    fn track_with(brush: Brush, points: Vec<Point>) -> Track {
        let mut segment = Segment::new(brush, 4.0, ChordType::Major);
        segment.points = points;
        let mut track = Track::default();
        track.segments = vec![segment];
        track
    }

    fn value(a: &Automation) -> f64 {
        match *a {
            Automation::SetValue { value, .. }
            | Automation::LinearRamp { value, .. }
            | Automation::ExponentialRamp { value, .. } => value,
            Automation::SetTarget { target, .. } => target,
        }
    }

    #[test]
    fn test_standard_stroke_is_one_ramp_voice() {
        let track = track_with(
            Brush::Standard,
            vec![Point::new(375.0, 100.0), Point::new(0.0, 0.0), Point::new(750.0, 50.0)],
        );
        let events = compile(2, &track, &ctx());
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.track, 2);
        assert_eq!(e.start, 0.0);
        assert_eq!(e.stop, 16.0 + RAMP_TAIL);

        let times: Vec<f64> = e.frequency.iter().map(Automation::time).collect();
        assert_eq!(times, vec![0.0, 8.0, 16.0]);
        let freqs: Vec<f64> = e.frequency.iter().map(value).collect();
        assert_eq!(freqs, vec![1000.0, 80.0, 540.0]);
        assert!(matches!(e.frequency[0], Automation::SetValue { .. }));
        assert!(matches!(e.frequency[1], Automation::LinearRamp { .. }));

        assert_eq!(e.gain, ramp_envelope(0.3, 0.0, 16.0));
    }

    #[test]
    fn test_single_point_is_not_dropped() {
        let track = track_with(Brush::Standard, vec![Point::new(75.0, 50.0)]);
        let events = compile(0, &track, &ctx());
        assert_eq!(events.len(), 1);
        let e = &events[0];
        let span = e.frequency.last().unwrap().time() - e.start;
        assert!(span > 0.0 && span < 0.02, "span {span}");
        assert!((e.start - 1.6).abs() < 1e-12);
    }

    #[test]
    fn test_empty_segment_is_skipped() {
        let track = track_with(Brush::Chord, Vec::new());
        assert!(compile(0, &track, &ctx()).is_empty());
    }

    #[test]
    fn test_chord_voices_share_timing() {
        let mut track = track_with(Brush::Chord, vec![Point::new(0.0, 0.0), Point::new(75.0, 0.0)]);
        track.segments[0].chord_type = ChordType::Minor;
        let events = compile(0, &track, &ctx());
        assert_eq!(events.len(), 3);
        for (e, interval) in events.iter().zip([0.0, 3.0, 7.0]) {
            assert_eq!(e.start, events[0].start);
            assert_eq!(e.stop, events[0].stop);
            assert!((value(&e.frequency[0]) - detuned(1000.0, interval)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_xenakis_spreads_five_quiet_voices() {
        let track = track_with(Brush::Xenakis, vec![Point::new(0.0, 50.0), Point::new(100.0, 50.0)]);
        let events = compile(0, &track, &ctx());
        assert_eq!(events.len(), XENAKIS_VOICES);
        assert_eq!(value(&events[0].gain[1]), 0.15);

        let center = &events[2];
        let expected = detuned(540.0, (100.0_f64 * 0.04).sin() * 0.15);
        assert!((value(&center.frequency[1]) - expected).abs() < 1e-9);

        let low = value(&events[0].frequency[0]);
        let wobble = (-3.0_f64).sin() * 0.15;
        assert!((low - detuned(540.0, -0.1 + wobble)).abs() < 1e-9);
    }

    #[test]
    fn test_particles_are_independent_grains() {
        let track = track_with(
            Brush::Particles,
            vec![Point::new(375.0, 0.0), Point::new(0.0, 100.0)],
        );
        let events = compile(0, &track, &ctx());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].start, 8.0);
        assert_eq!(events[0].stop, 8.0 + GRAIN_LENGTH);
        assert_eq!(events[1].frequency, vec![Automation::SetValue { time: 0.0, value: 80.0 }]);
        assert_eq!(events[1].gain, grain_envelope(0.0));
    }

    #[test]
    fn test_fractal_perturbation_is_deterministic() {
        let points = vec![
            Point { x: 100.0, y: 40.0, r_x: 0.3, r_y: -0.2 },
            Point { x: 200.0, y: 60.0, r_x: -0.4, r_y: 0.1 },
        ];
        let track = track_with(Brush::Fractal, points.clone());
        let mut c = ctx();
        c.chaos = 0.7;

        let a = compile(0, &track, &c);
        let b = compile(0, &track, &c);
        assert_eq!(a, b);

        let (x, y) = points[0].perturbed(0.7);
        assert_eq!(a[0].frequency[0].time(), c.time_at(x));
        assert_eq!(value(&a[0].frequency[0]), c.pitch_at(y));
    }

    #[test]
    fn test_times_never_negative() {
        let track = track_with(
            Brush::Fractal,
            vec![
                Point { x: 0.0, y: 0.0, r_x: -0.5, r_y: 0.0 },
                Point::new(10.0, 0.0),
            ],
        );
        let mut c = ctx();
        c.chaos = 1.0;
        let events = compile(0, &track, &c);
        assert_eq!(events[0].start, 0.0);
    }

    #[test]
    fn test_harmonize_quantizes_breakpoints() {
        let track = track_with(Brush::Standard, vec![Point::new(0.0, 37.0), Point::new(10.0, 37.0)]);
        let mut c = ctx();
        c.harmonize = true;
        c.scale = Scale::Pentatonic;
        let f = value(&compile(0, &track, &c)[0].frequency[0]);
        assert_eq!(f, crate::pitch::quantize(map_pitch(37.0, 100.0), Scale::Pentatonic));
    }

    #[test]
    fn test_loop_start_offsets_every_time() {
        let track = track_with(Brush::Standard, vec![Point::new(0.0, 0.0), Point::new(750.0, 0.0)]);
        let mut c = ctx();
        c.loop_start = 32.0;
        let e = &compile(0, &track, &c)[0];
        assert_eq!(e.start, 32.0);
        assert_eq!(e.frequency[1].time(), 48.0);
    }

    #[test]
    fn test_compile_all_keeps_track_order() {
        let tracks = vec![
            track_with(Brush::Standard, vec![Point::new(500.0, 0.0), Point::new(600.0, 0.0)]),
            Track::default(),
            track_with(Brush::Particles, vec![Point::new(0.0, 0.0)]),
        ];
        let events = compile_all(&tracks, &ctx());
        let owners: Vec<usize> = events.iter().map(|e| e.track).collect();
        assert_eq!(owners, vec![0, 2]);
    }
}
