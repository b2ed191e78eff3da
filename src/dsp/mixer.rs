//! Mixer: the stereo master bus and per-track level meters.

use serde::Serialize;

/// Peak level at which a meter shows a warning.
pub const WARNING_LEVEL: f32 = 0.75;
/// Peak level at which a meter shows clipping risk.
pub const PEAK_LEVEL: f32 = 0.95;

/// Summing stereo bus with a fixed master gain. No limiting: the WAV
/// encoder clamps, the live host does whatever its output does.
#[derive(Debug, Clone)]
pub struct Mixer {
    pub master_gain: f32,
    left: Vec<f32>,
    right: Vec<f32>,
}

impl Mixer {
    pub fn new(master_gain: f32) -> Self {
        Mixer {
            master_gain,
            left: Vec::new(),
            right: Vec::new(),
        }
    }

    /// Prepare `num_samples` of silence.
    pub fn clear(&mut self, num_samples: usize) {
        self.left.clear();
        self.left.resize(num_samples, 0.0);
        self.right.clear();
        self.right.resize(num_samples, 0.0);
    }

    /// Add a mono signal to both channels.
    pub fn add_mono(&mut self, input: &[f32]) {
        for ((l, r), &s) in self.left.iter_mut().zip(self.right.iter_mut()).zip(input) {
            *l += s;
            *r += s;
        }
    }

    /// Both channels for in-place accumulation.
    pub fn channels_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.left, &mut self.right)
    }

    /// Copy the bus, scaled by the master gain, into `out_l`/`out_r`.
    pub fn output(&self, out_l: &mut [f32], out_r: &mut [f32]) {
        for (o, &s) in out_l.iter_mut().zip(&self.left) {
            *o = s * self.master_gain;
        }
        for (o, &s) in out_r.iter_mut().zip(&self.right) {
            *o = s * self.master_gain;
        }
    }

    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }
}

/// Classification of a meter reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterLevel {
    Normal,
    Warning,
    Peak,
}

impl MeterLevel {
    pub fn classify(peak: f32) -> MeterLevel {
        if peak >= PEAK_LEVEL {
            MeterLevel::Peak
        } else if peak >= WARNING_LEVEL {
            MeterLevel::Warning
        } else {
            MeterLevel::Normal
        }
    }
}

/// Peak meter holding the loudest absolute sample of the last quantum.
#[derive(Debug, Clone, Copy, Default)]
pub struct LevelMeter {
    peak: f32,
}

impl LevelMeter {
    pub fn measure(&mut self, block: &[f32]) {
        self.peak = block.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
    }

    pub fn peak(&self) -> f32 {
        self.peak
    }

    pub fn level(&self) -> MeterLevel {
        MeterLevel::classify(self.peak)
    }
}
