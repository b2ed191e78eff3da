//! Effect rack parameter model: typed knobs and their engineering values.
//!
//! Every knob is a normalized 0..1 value. Each `Parameter` knows how to turn
//! its knob into the value the DSP unit consumes (seconds, Hz, gain, Q).

use serde::{Deserialize, Serialize};

use crate::config::EFFECT_COUNT;

/// The five effect buses, in send-matrix column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Delay,
    Reverb,
    Vibrato,
    Filter,
    Stutter,
}

impl EffectKind {
    pub const ALL: [EffectKind; EFFECT_COUNT] = [
        EffectKind::Delay,
        EffectKind::Reverb,
        EffectKind::Vibrato,
        EffectKind::Filter,
        EffectKind::Stutter,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            EffectKind::Delay => "delay",
            EffectKind::Reverb => "reverb",
            EffectKind::Vibrato => "vibrato",
            EffectKind::Filter => "filter",
            EffectKind::Stutter => "stutter",
        }
    }
}

/// Which panel a knob belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Effect(EffectKind),
    /// FRACTAL panel: brush distortion, not an effect bus.
    Fractal,
}

impl Unit {
    pub const COUNT: usize = EFFECT_COUNT + 1;

    pub const ALL: [Unit; Unit::COUNT] = [
        Unit::Effect(EffectKind::Delay),
        Unit::Effect(EffectKind::Reverb),
        Unit::Effect(EffectKind::Vibrato),
        Unit::Effect(EffectKind::Filter),
        Unit::Effect(EffectKind::Stutter),
        Unit::Fractal,
    ];

    pub fn index(self) -> usize {
        match self {
            Unit::Effect(effect) => effect.index(),
            Unit::Fractal => EFFECT_COUNT,
        }
    }

    /// Knobs the XY pad drives when this panel is linked: `(x, y)`.
    pub fn xy_parameters(self) -> (Parameter, Parameter) {
        match self {
            Unit::Effect(EffectKind::Delay) => (Parameter::DelayTime, Parameter::DelayFeedback),
            Unit::Effect(EffectKind::Reverb) => (Parameter::ReverbDecay, Parameter::ReverbMix),
            Unit::Effect(EffectKind::Vibrato) => (Parameter::VibratoRate, Parameter::VibratoDepth),
            Unit::Effect(EffectKind::Filter) => (Parameter::FilterFreq, Parameter::FilterRes),
            Unit::Effect(EffectKind::Stutter) => (Parameter::StutterRate, Parameter::StutterMix),
            Unit::Fractal => (Parameter::FractalChaos, Parameter::FractalMorph),
        }
    }
}

/// Panels whose knobs follow the XY pad.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XyLinks {
    linked: [bool; Unit::COUNT],
}

impl XyLinks {
    pub fn set(&mut self, unit: Unit, linked: bool) {
        self.linked[unit.index()] = linked;
    }

    pub fn is_linked(&self, unit: Unit) -> bool {
        self.linked[unit.index()]
    }

    pub fn any(&self) -> bool {
        self.linked.iter().any(|&l| l)
    }

    pub fn linked(&self) -> impl Iterator<Item = Unit> + '_ {
        Unit::ALL.into_iter().filter(|&u| self.is_linked(u))
    }
}

/// Every knob in the rack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Parameter {
    DelayTime,
    DelayFeedback,
    ReverbMix,
    ReverbDecay,
    VibratoRate,
    VibratoDepth,
    FilterFreq,
    FilterRes,
    StutterRate,
    StutterMix,
    FractalChaos,
    FractalMorph,
}

impl Parameter {
    pub const COUNT: usize = 12;

    pub const ALL: [Parameter; Parameter::COUNT] = [
        Parameter::DelayTime,
        Parameter::DelayFeedback,
        Parameter::ReverbMix,
        Parameter::ReverbDecay,
        Parameter::VibratoRate,
        Parameter::VibratoDepth,
        Parameter::FilterFreq,
        Parameter::FilterRes,
        Parameter::StutterRate,
        Parameter::StutterMix,
        Parameter::FractalChaos,
        Parameter::FractalMorph,
    ];

    pub fn unit(self) -> Unit {
        match self {
            Parameter::DelayTime | Parameter::DelayFeedback => Unit::Effect(EffectKind::Delay),
            Parameter::ReverbMix | Parameter::ReverbDecay => Unit::Effect(EffectKind::Reverb),
            Parameter::VibratoRate | Parameter::VibratoDepth => Unit::Effect(EffectKind::Vibrato),
            Parameter::FilterFreq | Parameter::FilterRes => Unit::Effect(EffectKind::Filter),
            Parameter::StutterRate | Parameter::StutterMix => Unit::Effect(EffectKind::Stutter),
            Parameter::FractalChaos | Parameter::FractalMorph => Unit::Fractal,
        }
    }

    /// Knob position of a freshly reset rack.
    pub fn default_knob(self) -> f64 {
        match self {
            Parameter::DelayTime => 0.4,
            Parameter::VibratoRate | Parameter::StutterRate => 0.3,
            _ => 0.0,
        }
    }

    /// Map a 0..1 knob to the engineering value the DSP unit uses.
    pub fn engineering(self, knob: f64) -> f64 {
        match self {
            Parameter::DelayTime => knob,
            Parameter::DelayFeedback => knob * 0.9,
            Parameter::ReverbMix => knob * 1.5,
            Parameter::ReverbDecay => knob,
            Parameter::VibratoRate => knob * 20.0,
            Parameter::VibratoDepth => knob * 0.01,
            // Cubic taper: perceptually even sweep across the audible range.
            Parameter::FilterFreq => knob.powi(3) * 22000.0,
            Parameter::FilterRes => knob * 15.0,
            Parameter::StutterRate => knob * 15.0 + 1.0,
            Parameter::StutterMix | Parameter::FractalChaos | Parameter::FractalMorph => knob,
        }
    }

    /// `(unit, field)` under which the value lives in a pattern document's `fx`.
    pub fn document_key(self) -> (&'static str, &'static str) {
        match self {
            Parameter::DelayTime => ("delay", "time"),
            Parameter::DelayFeedback => ("delay", "feedback"),
            Parameter::ReverbMix => ("reverb", "mix"),
            Parameter::ReverbDecay => ("reverb", "decay"),
            Parameter::VibratoRate => ("vibrato", "rate"),
            Parameter::VibratoDepth => ("vibrato", "depth"),
            Parameter::FilterFreq => ("filter", "freq"),
            Parameter::FilterRes => ("filter", "res"),
            Parameter::StutterRate => ("stutter", "rate"),
            Parameter::StutterMix => ("stutter", "mix"),
            Parameter::FractalChaos => ("fractal", "chaos"),
            Parameter::FractalMorph => ("fractal", "morph"),
        }
    }

    /// Multiplier between a knob and the value stored in a pattern document.
    pub fn document_scale(self) -> f64 {
        match self {
            Parameter::DelayFeedback => 0.9,
            Parameter::ReverbMix => 1.5,
            Parameter::VibratoRate => 20.0,
            Parameter::VibratoDepth => 0.01,
            _ => 1.0,
        }
    }
}

/// Knob positions of the whole rack.
#[derive(Debug, Clone, PartialEq)]
pub struct RackSettings {
    knobs: [f64; Parameter::COUNT],
}

impl Default for RackSettings {
    fn default() -> Self {
        RackSettings {
            knobs: Parameter::ALL.map(Parameter::default_knob),
        }
    }
}

impl RackSettings {
    pub fn knob(&self, parameter: Parameter) -> f64 {
        self.knobs[parameter as usize]
    }

    /// Set a knob, clamped to 0..1.
    pub fn set_knob(&mut self, parameter: Parameter, value: f64) {
        self.knobs[parameter as usize] = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    }

    pub fn value(&self, parameter: Parameter) -> f64 {
        parameter.engineering(self.knob(parameter))
    }

    pub fn chaos(&self) -> f64 {
        self.knob(Parameter::FractalChaos)
    }

    pub fn morph(&self) -> f64 {
        self.knob(Parameter::FractalMorph)
    }

    pub fn stutter_mix(&self) -> f64 {
        self.knob(Parameter::StutterMix)
    }
}
