//! Voice: one sounding note: oscillators sharing a single amplitude envelope.

use crate::compiler::VoiceEvent;
use crate::pattern::Brush;

use super::oscillator::{Oscillator, Waveform};
use super::param::{Automation, Param};
use super::shaper::DriveCurve;

/// One oscillator of a voice together with its frequency automation.
#[derive(Debug, Clone)]
struct Partial {
    oscillator: Oscillator,
    frequency: Param,
}

/// A voice renders between `start` (inclusive) and `stop` (exclusive),
/// context seconds. Outside that window it is silent and its oscillators do
/// not advance.
#[derive(Debug, Clone)]
pub struct Voice {
    pub track: usize,
    pub brush: Brush,
    partials: Vec<Partial>,
    /// Shared amplitude envelope.
    pub envelope: Param,
    drive: Option<DriveCurve>,
    start: f64,
    stop: f64,
    sample_rate: f64,
    env_buf: Vec<f32>,
    freq_buf: Vec<f32>,
}

impl Voice {
    /// Instantiate a compiled event: one oscillator with its own envelope.
    pub fn from_event(event: &VoiceEvent, sample_rate: f64) -> Self {
        let initial_freq = event
            .frequency
            .first()
            .map(|a| match *a {
                Automation::SetValue { value, .. }
                | Automation::LinearRamp { value, .. }
                | Automation::ExponentialRamp { value, .. } => value,
                Automation::SetTarget { target, .. } => target,
            })
            .unwrap_or(440.0);
        Voice {
            track: event.track,
            brush: event.brush,
            partials: vec![Partial {
                oscillator: Oscillator::new(event.waveform, sample_rate),
                frequency: Param::from_events(initial_freq, &event.frequency),
            }],
            envelope: Param::from_events(0.0, &event.gain),
            drive: None,
            start: event.start,
            stop: event.stop,
            sample_rate,
            env_buf: Vec::new(),
            freq_buf: Vec::new(),
        }
    }

    /// A voice with one oscillator per frequency, open-ended until `stop_at`.
    pub fn sustained(
        track: usize,
        brush: Brush,
        waveform: Waveform,
        frequencies: &[f64],
        start: f64,
        sample_rate: f64,
    ) -> Self {
        Voice {
            track,
            brush,
            partials: frequencies
                .iter()
                .map(|&f| Partial {
                    oscillator: Oscillator::new(waveform, sample_rate),
                    frequency: Param::new(f),
                })
                .collect(),
            envelope: Param::new(0.0),
            drive: None,
            start,
            stop: f64::INFINITY,
            sample_rate,
            env_buf: Vec::new(),
            freq_buf: Vec::new(),
        }
    }

    pub fn with_drive(mut self, drive: Option<DriveCurve>) -> Self {
        self.drive = drive;
        self
    }

    pub fn set_drive(&mut self, drive: Option<DriveCurve>) {
        self.drive = drive;
    }

    pub fn drive(&self) -> Option<DriveCurve> {
        self.drive
    }

    pub fn oscillator_count(&self) -> usize {
        self.partials.len()
    }

    /// Frequency automation of oscillator `index`.
    pub fn frequency_mut(&mut self, index: usize) -> Option<&mut Param> {
        self.partials.get_mut(index).map(|p| &mut p.frequency)
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn stop(&self) -> f64 {
        self.stop
    }

    /// Schedule the stop. A voice never stops later than already scheduled.
    pub fn stop_at(&mut self, time: f64) {
        self.stop = self.stop.min(time);
    }

    pub fn is_finished(&self, time: f64) -> bool {
        time >= self.stop
    }

    /// Add this voice's output for the frames starting at `time` into `out`.
    pub fn render(&mut self, time: f64, out: &mut [f32]) {
        let n = out.len();
        let sr = self.sample_rate;
        let end = time + n as f64 / sr;
        if end <= self.start || time >= self.stop {
            return;
        }
        let first = ((self.start - time) * sr).ceil().clamp(0.0, n as f64) as usize;
        let last = if self.stop.is_finite() {
            ((self.stop - time) * sr).ceil().clamp(0.0, n as f64) as usize
        } else {
            n
        };

        self.env_buf.resize(n, 0.0);
        self.freq_buf.resize(n, 0.0);
        self.envelope.fill(time, sr, &mut self.env_buf);

        for partial in &mut self.partials {
            partial.frequency.fill(time, sr, &mut self.freq_buf);
            for i in first..last {
                let mut s = partial.oscillator.next_sample(self.freq_buf[i] as f64);
                if let Some(drive) = &self.drive {
                    s = drive.apply(s);
                }
                out[i] += (s * self.env_buf[i] as f64) as f32;
            }
        }
    }
}
