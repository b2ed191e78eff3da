//! Stutter gate: rhythmic chopping by a slewed square LFO.

use super::filter::Biquad;
use super::oscillator::{Oscillator, Waveform};
use super::param::Param;

/// Cutoff of the lowpass that rounds the square edges (click-free gating).
pub const SLEW_FREQUENCY: f64 = 40.0;

/// Gate gain = `0.5·lowpass(square(rate)) + 0.5`, applied to the stutter bus.
#[derive(Debug, Clone)]
pub struct StutterGate {
    lfo: Oscillator,
    slew: Biquad,
    sample_rate: f64,
    rate_buf: Vec<f32>,
    /// LFO rate in Hz.
    pub rate: Param,
}

impl StutterGate {
    pub fn new(sample_rate: f64, rate: f64) -> Self {
        StutterGate {
            lfo: Oscillator::new(Waveform::Square, sample_rate),
            slew: Biquad::lowpass(sample_rate, SLEW_FREQUENCY, 1.0),
            sample_rate,
            rate_buf: Vec::new(),
            rate: Param::new(rate),
        }
    }

    /// Gate one quantum of the stutter bus in place.
    pub fn process(&mut self, time: f64, buf: &mut [f32]) {
        self.rate_buf.resize(buf.len(), 0.0);
        self.rate.fill(time, self.sample_rate, &mut self.rate_buf);
        for (s, &rate) in buf.iter_mut().zip(&self.rate_buf) {
            let square = self.lfo.next_sample(rate as f64);
            let gate = 0.5 * self.slew.process(square) + 0.5;
            *s *= gate as f32;
        }
    }
}
