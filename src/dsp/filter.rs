//! Biquad lowpass (WebAudio BiquadFilterNode coefficients) and the filter effect unit.

use std::f64::consts::PI;

use super::param::Param;
use super::shaper::DriveCurve;
use super::RENDER_QUANTUM;

/// A lowpass biquad IIR filter (2nd order).
///
/// Direct Form II Transposed. Coefficients follow the Audio EQ Cookbook with
/// the WebAudio convention of Q expressed in dB.
#[derive(Debug, Clone)]
pub struct Biquad {
    frequency: f64,
    q_db: f64,

    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,

    z1: f64,
    z2: f64,

    sample_rate: f64,
}

impl Biquad {
    pub fn lowpass(sample_rate: f64, frequency: f64, q_db: f64) -> Self {
        let mut f = Biquad {
            frequency,
            q_db,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z1: 0.0,
            z2: 0.0,
            sample_rate,
        };
        f.update_coefficients();
        f
    }

    /// Recompute coefficients only when a parameter actually moved.
    pub fn set_params(&mut self, frequency: f64, q_db: f64) {
        if frequency != self.frequency || q_db != self.q_db {
            self.frequency = frequency;
            self.q_db = q_db;
            self.update_coefficients();
        }
    }

    fn update_coefficients(&mut self) {
        let nyquist = self.sample_rate / 2.0;
        let normalized = self.frequency / nyquist;

        if normalized >= 1.0 {
            // Cutoff at or past Nyquist: pass the signal through.
            (self.b0, self.b1, self.b2, self.a1, self.a2) = (1.0, 0.0, 0.0, 0.0, 0.0);
            return;
        }
        if normalized <= 0.0 {
            (self.b0, self.b1, self.b2, self.a1, self.a2) = (0.0, 0.0, 0.0, 0.0, 0.0);
            return;
        }

        let w0 = PI * normalized;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * 10.0_f64.powf(self.q_db / 20.0));

        let b1 = 1.0 - cos_w0;
        let b0 = b1 / 2.0;
        let b2 = b0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_w0;
        let a2 = 1.0 - alpha;

        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
    }

    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        let output = self.b0 * input + self.z1;
        self.z1 = self.b1 * input - self.a1 * output + self.z2;
        self.z2 = self.b2 * input - self.a2 * output;
        output
    }

    pub fn process_block(&mut self, buf: &mut [f32]) {
        for s in buf.iter_mut() {
            *s = self.process(*s as f64) as f32;
        }
    }
}

/// Filter effect: drive waveshaper into one or two cascaded lowpass stages.
///
/// The live unit always cascades two stages (a steeper, ladder-like slope).
/// Cutoff and Q are evaluated once per render quantum.
#[derive(Debug, Clone)]
pub struct FilterUnit {
    pub frequency: Param,
    pub q: Param,
    drive: DriveCurve,
    stages: Vec<Biquad>,
    sample_rate: f64,
}

impl FilterUnit {
    pub fn new(sample_rate: f64, frequency: f64, q: f64, drive: DriveCurve, stages: usize) -> Self {
        FilterUnit {
            frequency: Param::new(frequency),
            q: Param::new(q),
            drive,
            stages: (0..stages.max(1))
                .map(|_| Biquad::lowpass(sample_rate, frequency, q))
                .collect(),
            sample_rate,
        }
    }

    pub fn drive(&self) -> DriveCurve {
        self.drive
    }

    /// Process one quantum of the filter bus in place.
    pub fn process(&mut self, time: f64, buf: &mut [f32]) {
        debug_assert!(buf.len() <= RENDER_QUANTUM);
        let frequency = self.frequency.value_at(time).clamp(0.0, self.sample_rate);
        let q = self.q.value_at(time);
        self.drive.process_block(buf);
        for stage in &mut self.stages {
            stage.set_params(frequency, q);
            stage.process_block(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady_amplitude(filter: &mut Biquad, freq: f64, sr: f64) -> f64 {
        let mut max_out = 0.0_f64;
        for i in 0..(sr as usize / 5) {
            let input = (2.0 * PI * freq * i as f64 / sr).sin();
            let out = filter.process(input);
            if i > sr as usize / 10 {
                max_out = max_out.max(out.abs());
            }
        }
        max_out
    }

    #[test]
    fn lowpass_passes_dc() {
        let mut f = Biquad::lowpass(44100.0, 5000.0, 0.0);
        let mut output = 0.0;
        for _ in 0..1000 {
            output = f.process(1.0);
        }
        assert!((output - 1.0).abs() < 0.001, "Lowpass should pass DC, got {output}");
    }

    #[test]
    fn lowpass_attenuates_high_freq() {
        let sr = 44100.0;
        let mut f = Biquad::lowpass(sr, 200.0, 0.0);
        let amp = steady_amplitude(&mut f, 10000.0, sr);
        assert!(amp < 0.01, "Lowpass@200Hz should strongly attenuate 10kHz, got {amp}");
    }

    #[test]
    fn q_in_db_boosts_cutoff() {
        let sr = 44100.0;
        let flat = steady_amplitude(&mut Biquad::lowpass(sr, 1000.0, 0.0), 1000.0, sr);
        let resonant = steady_amplitude(&mut Biquad::lowpass(sr, 1000.0, 12.0), 1000.0, sr);
        // 0 dB Q is unity gain at cutoff; 12 dB is roughly 4x.
        assert!((flat - 1.0).abs() < 0.05, "got {flat}");
        assert!((resonant - 3.98).abs() < 0.2, "got {resonant}");
    }

    #[test]
    fn cutoff_at_nyquist_passes_through() {
        let mut f = Biquad::lowpass(8000.0, 4000.0, 15.0);
        for x in [0.3, -0.7, 0.9] {
            assert_eq!(f.process(x), x);
        }
    }

    #[test]
    fn zero_cutoff_silences() {
        let mut f = Biquad::lowpass(8000.0, 0.0, 0.0);
        for x in [0.3, -0.7, 0.9] {
            assert_eq!(f.process(x), 0.0);
        }
    }

    #[test]
    fn filter_unit_follows_cutoff_param() {
        let sr = 8000.0;
        let mut unit = FilterUnit::new(sr, 0.0, 0.0, DriveCurve::WARM, 2);
        let mut buf = [0.5_f32; RENDER_QUANTUM];
        unit.process(0.0, &mut buf);
        assert!(buf.iter().all(|&s| s == 0.0));

        unit.frequency.set_value_at(22000.0, 0.0);
        let mut buf = [0.5_f32; RENDER_QUANTUM];
        unit.process(0.1, &mut buf);
        let expected = DriveCurve::WARM.apply(0.5) as f32;
        assert!(buf.iter().all(|&s| (s - expected).abs() < 1e-6));
    }
}
