//! Convolution reverb on a synthetic noise impulse, darkened by a fixed lowpass.
//!
//! Input → convolver (two-channel noise impulse) → 2500 Hz lowpass → mix gain.
//! Changing the decay regenerates the impulse after a debounce window, measured
//! on the audio clock, so a knob sweep produces exactly one rebuild.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::convolver::{BLOCK, Convolver};
use super::filter::Biquad;
use super::param::Param;

/// Cutoff of the damping lowpass after the convolver.
pub const DAMPING_FREQUENCY: f64 = 2500.0;
/// Quiet period after the last decay change before the impulse is rebuilt.
pub const DECAY_DEBOUNCE: f64 = 0.15;

/// Impulse length in seconds for a decay knob value.
pub fn impulse_seconds(decay: f64) -> f64 {
    0.1 + decay * 4.0
}

/// Two channels of white noise under a cubic decay envelope.
///
/// The same `seed` and `decay` always produce the same impulse.
pub fn noise_impulse(decay: f64, sample_rate: f64, seed: u64) -> [Vec<f32>; 2] {
    let len = (sample_rate * impulse_seconds(decay)).floor() as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut channel = || -> Vec<f32> {
        (0..len)
            .map(|j| {
                let noise: f64 = rng.gen_range(-1.0..1.0);
                (noise * (1.0 - j as f64 / len as f64).powi(3)) as f32
            })
            .collect()
    };
    let left = channel();
    let right = channel();
    [left, right]
}

#[derive(Debug)]
pub struct ReverbUnit {
    convolver: Convolver,
    damping: [Biquad; 2],
    decay: f64,
    pending_decay: Option<(f64, f64)>,
    seed: u64,
    sample_rate: f64,
    mix_buf: Vec<f32>,
    wet: [Vec<f32>; 2],
    /// Output gain of the wet signal.
    pub mix: Param,
}

impl ReverbUnit {
    pub fn new(sample_rate: f64, decay: f64, mix: f64, seed: u64) -> Self {
        ReverbUnit {
            convolver: Convolver::new(&noise_impulse(decay, sample_rate, seed), sample_rate),
            // WebAudio's default biquad Q is 1 (dB).
            damping: [
                Biquad::lowpass(sample_rate, DAMPING_FREQUENCY, 1.0),
                Biquad::lowpass(sample_rate, DAMPING_FREQUENCY, 1.0),
            ],
            decay,
            pending_decay: None,
            seed,
            sample_rate,
            mix_buf: vec![0.0; BLOCK],
            wet: [vec![0.0; BLOCK], vec![0.0; BLOCK]],
            mix: Param::new(mix),
        }
    }

    /// Decay the current impulse was built for.
    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn has_pending_rebuild(&self) -> bool {
        self.pending_decay.is_some()
    }

    /// Request a new decay; the rebuild happens once `now + DECAY_DEBOUNCE`
    /// passes without another request.
    pub fn set_decay(&mut self, decay: f64, now: f64) {
        self.pending_decay = Some((decay, now + DECAY_DEBOUNCE));
    }

    fn rebuild_if_due(&mut self, time: f64) {
        let Some((decay, due)) = self.pending_decay else {
            return;
        };
        if time < due {
            return;
        }
        self.pending_decay = None;
        self.decay = decay;
        self.convolver = Convolver::new(&noise_impulse(decay, self.sample_rate, self.seed), self.sample_rate);
        debug!(decay, seconds = impulse_seconds(decay), "reverb impulse rebuilt");
    }

    /// Process one quantum of the reverb bus, adding the wet signal to `out_l`/`out_r`.
    pub fn process(&mut self, time: f64, input: &[f32], out_l: &mut [f32], out_r: &mut [f32]) {
        self.rebuild_if_due(time);

        let [wet_l, wet_r] = &mut self.wet;
        self.convolver.process(input, wet_l, wet_r);
        self.mix.fill(time, self.sample_rate, &mut self.mix_buf);

        for (channel, (wet, out)) in [(wet_l, out_l), (wet_r, out_r)].into_iter().enumerate() {
            self.damping[channel].process_block(wet);
            for ((o, &w), &g) in out.iter_mut().zip(wet.iter()).zip(&self.mix_buf) {
                *o += w * g;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impulse_is_seeded_and_decays() {
        let a = noise_impulse(0.25, 8000.0, 7);
        let b = noise_impulse(0.25, 8000.0, 7);
        assert_eq!(a, b);
        assert_eq!(a[0].len(), (8000.0 * 1.1_f64).floor() as usize);
        assert_ne!(a[0], a[1], "channels are decorrelated");

        let head: f32 = a[0][..800].iter().map(|s| s.abs()).sum();
        let tail: f32 = a[0][a[0].len() - 800..].iter().map(|s| s.abs()).sum();
        assert!(head > tail * 50.0);
    }

    #[test]
    fn decay_rebuild_is_debounced_to_last_value() {
        let mut reverb = ReverbUnit::new(8000.0, 0.0, 1.0, 1);
        let input = [0.0_f32; BLOCK];
        let (mut l, mut r) = ([0.0_f32; BLOCK], [0.0_f32; BLOCK]);

        reverb.set_decay(0.2, 0.00);
        reverb.set_decay(0.5, 0.05);
        reverb.set_decay(0.7, 0.10);

        reverb.process(0.20, &input, &mut l, &mut r);
        assert!(reverb.has_pending_rebuild(), "still inside the debounce window");
        assert_eq!(reverb.decay(), 0.0);

        reverb.process(0.26, &input, &mut l, &mut r);
        assert!(!reverb.has_pending_rebuild());
        assert_eq!(reverb.decay(), 0.7);
    }

    #[test]
    fn wet_signal_scaled_by_mix() {
        let sr = 8000.0;
        let mut loud = ReverbUnit::new(sr, 0.0, 1.5, 3);
        let mut muted = ReverbUnit::new(sr, 0.0, 0.0, 3);
        let mut input = [0.0_f32; BLOCK];
        input[0] = 1.0;

        let (mut l, mut r) = ([0.0_f32; BLOCK], [0.0_f32; BLOCK]);
        loud.process(0.0, &input, &mut l, &mut r);
        assert!(l.iter().any(|&s| s.abs() > 0.0));

        let (mut l, mut r) = ([0.0_f32; BLOCK], [0.0_f32; BLOCK]);
        muted.process(0.0, &input, &mut l, &mut r);
        assert!(l.iter().chain(r.iter()).all(|&s| s == 0.0));
    }
}
