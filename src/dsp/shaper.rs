//! Saturation curves for the filter drive stage and fractal voices.

use std::f64::consts::PI;

/// A static waveshaping curve. Input is clamped to [-1, 1] before shaping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriveCurve {
    /// `tanh(x·(1 + amount/10))`. With amount 0 this is a gentle soft clip.
    Warm { amount: f64 },
    /// `(3 + k)·x·20° / (π + k·|x|)`, a hard, folded distortion for large `k`.
    Distortion { k: f64 },
}

impl DriveCurve {
    /// The drive stage in front of the filter unit.
    pub const WARM: DriveCurve = DriveCurve::Warm { amount: 0.0 };

    /// Curve applied to fractal-brush voices for a FRACTAL MORPH knob value.
    pub fn fractal_morph(morph: f64) -> DriveCurve {
        DriveCurve::Distortion {
            k: 80.0 + morph * 400.0,
        }
    }

    /// Older offline-export drive: distortion scaled by filter resonance.
    pub fn legacy_export(resonance: f64) -> DriveCurve {
        DriveCurve::Distortion { k: resonance * 50.0 }
    }

    #[inline]
    pub fn apply(&self, x: f64) -> f64 {
        let x = x.clamp(-1.0, 1.0);
        match *self {
            DriveCurve::Warm { amount } => (x * (1.0 + amount / 10.0)).tanh(),
            DriveCurve::Distortion { k } => {
                let deg = PI / 180.0;
                (3.0 + k) * x * 20.0 * deg / (PI + k * x.abs())
            }
        }
    }

    pub fn process_block(&self, buf: &mut [f32]) {
        for s in buf.iter_mut() {
            *s = self.apply(*s as f64) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warm_curve_is_soft_clip() {
        let c = DriveCurve::WARM;
        assert_eq!(c.apply(0.0), 0.0);
        assert!((c.apply(0.5) - 0.5_f64.tanh()).abs() < 1e-12);
        assert!((c.apply(5.0) - 1.0_f64.tanh()).abs() < 1e-12, "input is clamped");
    }

    #[test]
    fn distortion_curve_is_odd_and_bounded() {
        let c = DriveCurve::fractal_morph(0.5);
        for i in 0..=20 {
            let x = i as f64 / 10.0 - 1.0;
            let y = c.apply(x);
            assert!((y + c.apply(-x)).abs() < 1e-12);
            assert!(y.abs() <= 1.0, "{x} -> {y}");
        }
    }

    #[test]
    fn legacy_export_curve_scales_with_resonance() {
        let soft = DriveCurve::legacy_export(0.0).apply(0.5);
        let hard = DriveCurve::legacy_export(1.0).apply(0.5);
        // k = 0 reduces to a linear gain of 3·20°/π.
        assert!((soft - 0.5 * 3.0 * 20.0 / 180.0).abs() < 1e-12);
        assert!(hard > soft);
    }
}
