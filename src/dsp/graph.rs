//! Render graph: the topology shared by the live engine and offline export.
//!
//! ```text
//! voices ─► track gain ─┬─► dry ──────────────────────────────┐
//!                       ├─► send ─► delay ────────────────────┤
//!                       ├─► send ─► reverb (stereo) ──────────┤
//!                       ├─► send ─► vibrato ──────────────────┼─► master
//!                       ├─► send ─► drive ─► lowpass ×N ──────┤
//!                       └─► send ─► stutter gate ─────────────┘
//! ```
//!
//! Every gain in the graph is a `Param`, so live changes glide instead of
//! stepping. The graph always advances in whole render quanta.

use tracing::warn;

use super::delay::Delay;
use super::filter::FilterUnit;
use super::mixer::{LevelMeter, Mixer};
use super::param::{PARAM_SMOOTHING, Param};
use super::recorder::MasterTap;
use super::reverb::ReverbUnit;
use super::shaper::DriveCurve;
use super::stutter::StutterGate;
use super::vibrato::Vibrato;
use super::voice::Voice;
use super::RENDER_QUANTUM;
use crate::config::{EFFECT_COUNT, EngineConfig, TRACK_COUNT};
use crate::rack::{EffectKind, Parameter, RackSettings};
use crate::routing::SendMatrix;

/// How a graph is built: the parts that differ between live and offline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphSpec {
    pub sample_rate: f64,
    pub master_gain: f64,
    pub impulse_seed: u64,
    /// Waveshaper in front of the filter stages.
    pub drive: DriveCurve,
    pub filter_stages: usize,
    /// Whether per-track level meters tap the dry bus.
    pub metered: bool,
}

impl GraphSpec {
    /// The persistent graph heard while playing.
    pub fn live(config: &EngineConfig) -> Self {
        GraphSpec {
            sample_rate: config.sample_rate,
            master_gain: config.master_gain,
            impulse_seed: config.impulse_seed,
            drive: DriveCurve::WARM,
            filter_stages: 2,
            metered: true,
        }
    }

    /// A one-shot export graph. Same topology as live unless the legacy
    /// export drive is switched on.
    pub fn offline(config: &EngineConfig, sample_rate: f64, rack: &RackSettings) -> Self {
        let mut spec = GraphSpec {
            sample_rate,
            metered: false,
            ..GraphSpec::live(config)
        };
        if config.legacy_export_drive {
            warn!("offline graph uses the legacy export drive; export will not match live playback");
            spec.drive = DriveCurve::legacy_export(rack.knob(Parameter::FilterRes));
            spec.filter_stages = 1;
        }
        spec
    }
}

#[derive(Debug, Clone)]
struct TrackStrip {
    gain: Param,
    dry: Param,
    sends: [Param; EFFECT_COUNT],
    meter: LevelMeter,
}

#[derive(Debug)]
pub struct RenderGraph {
    sample_rate: f64,
    metered: bool,
    strips: Vec<TrackStrip>,
    track_bufs: Vec<Vec<f32>>,
    buses: [Vec<f32>; EFFECT_COUNT],
    gain_buf: Vec<f32>,
    scratch: Vec<f32>,
    delay: Delay,
    reverb: ReverbUnit,
    vibrato: Vibrato,
    filter: FilterUnit,
    stutter: StutterGate,
    mixer: Mixer,
    /// Armed master recording.
    tap: Option<MasterTap>,
}

impl RenderGraph {
    /// Build a graph with every gain and unit parameter at its snapshot value.
    pub fn new(
        spec: &GraphSpec,
        rack: &RackSettings,
        matrix: &SendMatrix,
        track_gains: [f64; TRACK_COUNT],
    ) -> Self {
        let sr = spec.sample_rate;
        let stutter_mix = rack.stutter_mix();
        let strips = (0..TRACK_COUNT)
            .map(|track| TrackStrip {
                gain: Param::new(track_gains[track]),
                dry: Param::new(matrix.dry_gain(track, stutter_mix)),
                sends: EffectKind::ALL.map(|e| Param::new(matrix.send_gain(track, e, stutter_mix))),
                meter: LevelMeter::default(),
            })
            .collect();

        RenderGraph {
            sample_rate: sr,
            metered: spec.metered,
            strips,
            track_bufs: vec![vec![0.0; RENDER_QUANTUM]; TRACK_COUNT],
            buses: std::array::from_fn(|_| vec![0.0; RENDER_QUANTUM]),
            gain_buf: vec![0.0; RENDER_QUANTUM],
            scratch: vec![0.0; RENDER_QUANTUM],
            delay: Delay::new(
                sr,
                rack.value(Parameter::DelayTime),
                rack.value(Parameter::DelayFeedback),
            ),
            reverb: ReverbUnit::new(
                sr,
                rack.value(Parameter::ReverbDecay),
                rack.value(Parameter::ReverbMix),
                spec.impulse_seed,
            ),
            vibrato: Vibrato::new(
                sr,
                rack.value(Parameter::VibratoRate),
                rack.value(Parameter::VibratoDepth),
            ),
            filter: FilterUnit::new(
                sr,
                rack.value(Parameter::FilterFreq),
                rack.value(Parameter::FilterRes),
                spec.drive,
                spec.filter_stages,
            ),
            stutter: StutterGate::new(sr, rack.value(Parameter::StutterRate)),
            mixer: Mixer::new(spec.master_gain as f32),
            tap: None,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn filter_drive(&self) -> DriveCurve {
        self.filter.drive()
    }

    pub fn reverb(&self) -> &ReverbUnit {
        &self.reverb
    }

    /// Glide every strip to its gain.
    pub fn set_track_gains(&mut self, gains: [f64; TRACK_COUNT], now: f64) {
        for (strip, gain) in self.strips.iter_mut().zip(gains) {
            strip.gain.glide_to(gain, now, PARAM_SMOOTHING);
        }
    }

    /// Glide every dry and send gain to what `matrix` asks for.
    pub fn apply_routing(&mut self, matrix: &SendMatrix, stutter_mix: f64, now: f64) {
        for (track, strip) in self.strips.iter_mut().enumerate() {
            strip
                .dry
                .glide_to(matrix.dry_gain(track, stutter_mix), now, PARAM_SMOOTHING);
            for effect in EffectKind::ALL {
                strip.sends[effect.index()].glide_to(
                    matrix.send_gain(track, effect, stutter_mix),
                    now,
                    PARAM_SMOOTHING,
                );
            }
        }
    }

    /// Push one knob's current value into the running unit.
    pub fn apply_parameter(&mut self, parameter: Parameter, rack: &RackSettings, matrix: &SendMatrix, now: f64) {
        let value = rack.value(parameter);
        let target = match parameter {
            Parameter::DelayTime => &mut self.delay.time,
            Parameter::DelayFeedback => &mut self.delay.feedback,
            Parameter::ReverbMix => &mut self.reverb.mix,
            Parameter::ReverbDecay => {
                self.reverb.set_decay(value, now);
                return;
            }
            Parameter::VibratoRate => &mut self.vibrato.rate,
            Parameter::VibratoDepth => &mut self.vibrato.depth,
            Parameter::FilterFreq => &mut self.filter.frequency,
            Parameter::FilterRes => &mut self.filter.q,
            Parameter::StutterRate => &mut self.stutter.rate,
            Parameter::StutterMix => {
                self.apply_routing(matrix, rack.stutter_mix(), now);
                return;
            }
            // Fractal knobs shape voices, not the graph.
            Parameter::FractalChaos | Parameter::FractalMorph => return,
        };
        target.glide_to(value, now, PARAM_SMOOTHING);
    }

    /// Latest dry-bus reading of a track. `None` on unmetered graphs.
    pub fn meter(&self, track: usize) -> Option<&LevelMeter> {
        if !self.metered {
            return None;
        }
        self.strips.get(track).map(|s| &s.meter)
    }

    /// Render one quantum starting at context time `time` into `out_l`/`out_r`
    /// (each `RENDER_QUANTUM` long).
    pub fn render_quantum<'a>(
        &mut self,
        time: f64,
        voices: impl IntoIterator<Item = &'a mut Voice>,
        out_l: &mut [f32],
        out_r: &mut [f32],
    ) {
        let sr = self.sample_rate;

        for buf in &mut self.track_bufs {
            buf.fill(0.0);
        }
        for voice in voices {
            if let Some(buf) = self.track_bufs.get_mut(voice.track) {
                voice.render(time, buf);
            }
        }

        for bus in &mut self.buses {
            bus.fill(0.0);
        }
        self.mixer.clear(RENDER_QUANTUM);

        for (strip, buf) in self.strips.iter_mut().zip(&mut self.track_bufs) {
            strip.gain.fill(time, sr, &mut self.gain_buf);
            for (s, &g) in buf.iter_mut().zip(&self.gain_buf) {
                *s *= g;
            }

            strip.dry.fill(time, sr, &mut self.gain_buf);
            for ((d, &s), &g) in self.scratch.iter_mut().zip(buf.iter()).zip(&self.gain_buf) {
                *d = s * g;
            }
            if self.metered {
                strip.meter.measure(&self.scratch);
            }
            self.mixer.add_mono(&self.scratch);

            for (send, bus) in strip.sends.iter().zip(&mut self.buses) {
                send.fill(time, sr, &mut self.gain_buf);
                for ((b, &s), &g) in bus.iter_mut().zip(buf.iter()).zip(&self.gain_buf) {
                    *b += s * g;
                }
            }
        }

        let [delay_bus, reverb_bus, vibrato_bus, filter_bus, stutter_bus] = &mut self.buses;

        self.delay.process(time, delay_bus);
        self.mixer.add_mono(delay_bus);

        let (left, right) = self.mixer.channels_mut();
        self.reverb.process(time, reverb_bus, left, right);

        self.vibrato.process(time, vibrato_bus);
        self.mixer.add_mono(vibrato_bus);

        self.filter.process(time, filter_bus);
        self.mixer.add_mono(filter_bus);

        self.stutter.process(time, stutter_bus);
        self.mixer.add_mono(stutter_bus);

        self.mixer.output(out_l, out_r);
        if let Some(tap) = &mut self.tap {
            tap.capture(out_l, out_r);
        }
    }

    /// Start capturing the master output. Replaces any running capture.
    pub fn arm_tap(&mut self, max_frames: usize) {
        self.tap = Some(MasterTap::new(max_frames));
    }

    /// Stop capturing and hand back what was recorded.
    pub fn disarm_tap(&mut self) -> Option<MasterTap> {
        self.tap.take()
    }

    pub fn tap(&self) -> Option<&MasterTap> {
        self.tap.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::oscillator::Waveform;
    use crate::dsp::param::Automation;
    use crate::pattern::Brush;

    const SR: f64 = 8000.0;

    fn spec() -> GraphSpec {
        GraphSpec {
            sample_rate: SR,
            master_gain: 1.0,
            impulse_seed: 1,
            drive: DriveCurve::WARM,
            filter_stages: 2,
            metered: true,
        }
    }

    fn tone(track: usize) -> Voice {
        let mut v = Voice::sustained(track, Brush::Standard, Waveform::Sine, &[440.0], 0.0, SR);
        v.envelope.insert(Automation::SetValue { time: 0.0, value: 0.5 });
        v
    }

    fn render(graph: &mut RenderGraph, voices: &mut [Voice], quanta: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = Vec::new();
        let mut right = Vec::new();
        let mut l = vec![0.0; RENDER_QUANTUM];
        let mut r = vec![0.0; RENDER_QUANTUM];
        for q in 0..quanta {
            let time = (q * RENDER_QUANTUM) as f64 / SR;
            graph.render_quantum(time, voices.iter_mut(), &mut l, &mut r);
            left.extend_from_slice(&l);
            right.extend_from_slice(&r);
        }
        (left, right)
    }

    fn peak(buf: &[f32]) -> f32 {
        buf.iter().fold(0.0, |m, s| m.max(s.abs()))
    }

    #[test]
    fn unrouted_track_is_dry_and_metered() {
        let mut graph = RenderGraph::new(&spec(), &RackSettings::default(), &SendMatrix::new(), [1.0; 4]);
        let mut voices = vec![tone(1)];
        let (left, right) = render(&mut graph, &mut voices, 20);
        assert!((peak(&left) - 0.5).abs() < 0.01);
        assert_eq!(left, right);
        assert!((graph.meter(1).unwrap().peak() - 0.5).abs() < 0.02);
        assert_eq!(graph.meter(0).unwrap().peak(), 0.0);
    }

    #[test]
    fn filter_route_removes_dry_path() {
        // Default FREQ knob is 0, so the filter silences what it receives.
        let mut matrix = SendMatrix::new();
        matrix.set_route(0, EffectKind::Filter, true).unwrap();
        let mut graph = RenderGraph::new(&spec(), &RackSettings::default(), &matrix, [1.0; 4]);
        let (left, _) = render(&mut graph, &mut [tone(0)], 20);
        assert_eq!(peak(&left), 0.0);
        assert_eq!(graph.meter(0).unwrap().peak(), 0.0);
    }

    #[test]
    fn stutter_route_splits_dry_and_send() {
        let mut rack = RackSettings::default();
        rack.set_knob(Parameter::StutterMix, 0.6);
        let mut matrix = SendMatrix::new();
        matrix.set_route(0, EffectKind::Stutter, true).unwrap();
        let mut graph = RenderGraph::new(&spec(), &rack, &matrix, [1.0; 4]);
        render(&mut graph, &mut [tone(0)], 20);
        assert!((graph.meter(0).unwrap().peak() - 0.2).abs() < 0.01);
    }

    #[test]
    fn track_gain_glides_instead_of_stepping() {
        let mut graph = RenderGraph::new(&spec(), &RackSettings::default(), &SendMatrix::new(), [1.0; 4]);
        let mut voices = vec![tone(0)];
        render(&mut graph, &mut voices, 4);
        let now = (4 * RENDER_QUANTUM) as f64 / SR;
        graph.set_track_gains([0.0, 1.0, 1.0, 1.0], now);

        let mut l = vec![0.0; RENDER_QUANTUM];
        let mut r = vec![0.0; RENDER_QUANTUM];
        graph.render_quantum(now, voices.iter_mut(), &mut l, &mut r);
        assert!(peak(&l) > 0.3, "gain must not drop instantly");

        let (tail, _) = render(&mut graph, &mut voices, 60);
        assert!(peak(&tail[tail.len() - RENDER_QUANTUM..]) < 0.01);
    }

    #[test]
    fn reverb_route_is_stereo() {
        let mut rack = RackSettings::default();
        rack.set_knob(Parameter::ReverbMix, 1.0);
        rack.set_knob(Parameter::ReverbDecay, 0.1);
        let mut matrix = SendMatrix::new();
        matrix.set_route(2, EffectKind::Reverb, true).unwrap();
        let mut graph = RenderGraph::new(&spec(), &rack, &matrix, [1.0; 4]);
        let (left, right) = render(&mut graph, &mut [tone(2)], 40);
        assert_ne!(left, right);
    }

    #[test]
    fn identical_graphs_render_identically() {
        let mut rack = RackSettings::default();
        rack.set_knob(Parameter::FilterFreq, 0.4);
        rack.set_knob(Parameter::ReverbMix, 0.5);
        let mut matrix = SendMatrix::new();
        matrix.set_route(0, EffectKind::Delay, true).unwrap();
        matrix.set_route(0, EffectKind::Reverb, true).unwrap();
        matrix.set_route(1, EffectKind::Filter, true).unwrap();
        matrix.set_route(1, EffectKind::Vibrato, true).unwrap();

        let mut a = RenderGraph::new(&spec(), &rack, &matrix, [0.8; 4]);
        let mut b = RenderGraph::new(&GraphSpec { metered: false, ..spec() }, &rack, &matrix, [0.8; 4]);
        let out_a = render(&mut a, &mut [tone(0), tone(1)], 30);
        let out_b = render(&mut b, &mut [tone(0), tone(1)], 30);
        assert_eq!(out_a, out_b);
        assert!(b.meter(0).is_none());
    }

    #[test]
    fn legacy_export_drive_is_opt_in() {
        let rack = RackSettings::default();
        let mut config = EngineConfig::default();
        let spec = GraphSpec::offline(&config, 22050.0, &rack);
        assert_eq!(spec.drive, DriveCurve::WARM);
        assert_eq!(spec.filter_stages, 2);
        assert!(!spec.metered);

        config.legacy_export_drive = true;
        let spec = GraphSpec::offline(&config, 22050.0, &rack);
        assert_eq!(spec.drive, DriveCurve::legacy_export(0.0));
        assert_eq!(spec.filter_stages, 1);
        let graph = RenderGraph::new(&spec, &rack, &SendMatrix::new(), [1.0; 4]);
        assert_eq!(graph.filter_drive(), DriveCurve::legacy_export(0.0));
    }
}
