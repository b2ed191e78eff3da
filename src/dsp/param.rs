//! Automation timeline: scheduled parameter changes evaluated on the context clock.
//!
//! Every value that changes while audio is running (gains, cutoffs, delay
//! times, oscillator frequencies, envelopes) is a `Param`. Changes are
//! scheduled as ramps or exponential approaches at absolute context times,
//! never applied as instantaneous steps on a running graph.

use serde::{Deserialize, Serialize};

/// Time constant for knob, routing and volume changes (seconds).
pub const PARAM_SMOOTHING: f64 = 0.05;

/// A single scheduled change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Automation {
    /// Jump to `value` at `time`.
    SetValue { time: f64, value: f64 },
    /// Ramp linearly from the previous event to `value`, arriving at `time`.
    LinearRamp { time: f64, value: f64 },
    /// Ramp exponentially from the previous event to `value`, arriving at `time`.
    ExponentialRamp { time: f64, value: f64 },
    /// Approach `target` from `time` on with the given time constant.
    SetTarget {
        time: f64,
        target: f64,
        time_constant: f64,
    },
}

impl Automation {
    pub fn time(&self) -> f64 {
        match *self {
            Automation::SetValue { time, .. }
            | Automation::LinearRamp { time, .. }
            | Automation::ExponentialRamp { time, .. }
            | Automation::SetTarget { time, .. } => time,
        }
    }
}

/// An automatable parameter: an initial value plus a time-sorted event list.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    initial: f64,
    events: Vec<Automation>,
}

impl Param {
    pub fn new(value: f64) -> Self {
        Param {
            initial: value,
            events: Vec::new(),
        }
    }

    /// Build a parameter from a list of events (in any order).
    pub fn from_events(initial: f64, events: &[Automation]) -> Self {
        let mut param = Param::new(initial);
        for &event in events {
            param.insert(event);
        }
        param
    }

    pub fn events(&self) -> &[Automation] {
        &self.events
    }

    /// Insert an event after every event scheduled at the same or earlier time.
    pub fn insert(&mut self, event: Automation) {
        let time = event.time();
        let pos = self.events.partition_point(|e| e.time() <= time);
        self.events.insert(pos, event);
    }

    pub fn set_value_at(&mut self, value: f64, time: f64) {
        self.insert(Automation::SetValue { time, value });
    }

    pub fn linear_ramp_to(&mut self, value: f64, time: f64) {
        self.insert(Automation::LinearRamp { time, value });
    }

    pub fn exponential_ramp_to(&mut self, value: f64, time: f64) {
        self.insert(Automation::ExponentialRamp { time, value });
    }

    pub fn set_target_at(&mut self, target: f64, time: f64, time_constant: f64) {
        self.insert(Automation::SetTarget {
            time,
            target,
            time_constant,
        });
    }

    /// Smoothly move towards `target` starting at `now`, dropping history first.
    pub fn glide_to(&mut self, target: f64, now: f64, time_constant: f64) {
        self.compact(now);
        self.cancel_after(now);
        self.set_target_at(target, now, time_constant);
    }

    /// Remove every event scheduled strictly after `time`.
    pub fn cancel_after(&mut self, time: f64) {
        self.events.retain(|e| e.time() <= time);
    }

    /// Value of the parameter at context time `t`.
    pub fn value_at(&self, t: f64) -> f64 {
        let mut prev_time = 0.0_f64;
        let mut prev_value = self.initial;
        let mut target: Option<(f64, f64)> = None;

        for event in &self.events {
            let time = event.time();
            match *event {
                Automation::SetValue { value, .. } => {
                    if time > t {
                        break;
                    }
                    prev_value = value;
                    target = None;
                }
                Automation::LinearRamp { value, .. } => {
                    if time > t {
                        return lerp(prev_time, prev_value, time, value, t);
                    }
                    prev_value = value;
                    target = None;
                }
                Automation::ExponentialRamp { value, .. } => {
                    if time > t {
                        if prev_value > 0.0 && value > 0.0 {
                            let frac = fraction(prev_time, time, t);
                            return prev_value * (value / prev_value).powf(frac);
                        }
                        return lerp(prev_time, prev_value, time, value, t);
                    }
                    prev_value = value;
                    target = None;
                }
                Automation::SetTarget {
                    target: goal,
                    time_constant,
                    ..
                } => {
                    if time > t {
                        break;
                    }
                    prev_value = settle(prev_time, prev_value, target, time);
                    target = Some((goal, time_constant));
                }
            }
            prev_time = time;
        }

        settle(prev_time, prev_value, target, t)
    }

    /// Fold every event that is fully in the past into a single `SetValue`.
    ///
    /// Values at and after `now` are unchanged.
    pub fn compact(&mut self, now: f64) {
        let Some(k) = self.events.iter().rposition(|e| e.time() <= now) else {
            return;
        };
        let time = self.events[k].time();
        let value = self.value_at(time);
        let keep_from = match self.events[k] {
            Automation::SetTarget { .. } => k,
            _ => k + 1,
        };
        let mut events = Vec::with_capacity(self.events.len() - keep_from + 1);
        events.push(Automation::SetValue { time, value });
        events.extend_from_slice(&self.events[keep_from..]);
        self.events = events;
    }

    /// Fill `out` with values for consecutive frames starting at `start`.
    ///
    /// Quanta without an event inside are interpolated between their edges;
    /// quanta containing an event are evaluated frame by frame.
    pub fn fill(&self, start: f64, sample_rate: f64, out: &mut [f32]) {
        if self.events.is_empty() {
            out.fill(self.initial as f32);
            return;
        }
        let n = out.len();
        let end = start + n as f64 / sample_rate;
        let first_after_start = self.events.partition_point(|e| e.time() <= start);
        let event_inside = self
            .events
            .get(first_after_start)
            .is_some_and(|e| e.time() < end);

        if event_inside {
            for (i, v) in out.iter_mut().enumerate() {
                *v = self.value_at(start + i as f64 / sample_rate) as f32;
            }
        } else {
            let a = self.value_at(start);
            let b = self.value_at(end);
            for (i, v) in out.iter_mut().enumerate() {
                *v = (a + (b - a) * i as f64 / n as f64) as f32;
            }
        }
    }
}

fn fraction(t0: f64, t1: f64, t: f64) -> f64 {
    if t1 <= t0 {
        1.0
    } else {
        ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
    }
}

fn lerp(t0: f64, v0: f64, t1: f64, v1: f64, t: f64) -> f64 {
    v0 + (v1 - v0) * fraction(t0, t1, t)
}

fn settle(anchor_time: f64, anchor_value: f64, target: Option<(f64, f64)>, t: f64) -> f64 {
    match target {
        Some((goal, tau)) if tau > 0.0 => {
            goal + (anchor_value - goal) * (-(t - anchor_time).max(0.0) / tau).exp()
        }
        Some((goal, _)) => goal,
        None => anchor_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_without_events() {
        let p = Param::new(0.7);
        assert_eq!(p.value_at(0.0), 0.7);
        assert_eq!(p.value_at(100.0), 0.7);
    }

    #[test]
    fn linear_ramp_interpolates() {
        let mut p = Param::new(0.0);
        p.set_value_at(0.0, 1.0);
        p.linear_ramp_to(1.0, 2.0);
        assert!((p.value_at(0.5) - 0.0).abs() < 1e-12);
        assert!((p.value_at(1.5) - 0.5).abs() < 1e-12);
        assert!((p.value_at(3.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn exponential_ramp_is_geometric() {
        let mut p = Param::new(0.0);
        p.set_value_at(0.4, 0.0);
        p.exponential_ramp_to(0.004, 1.0);
        let mid = p.value_at(0.5);
        assert!((mid - 0.04).abs() < 1e-9, "geometric midpoint expected, got {mid}");
    }

    #[test]
    fn exponential_ramp_from_zero_falls_back_to_linear() {
        let mut p = Param::new(0.0);
        p.set_value_at(0.0, 0.0);
        p.exponential_ramp_to(1.0, 1.0);
        assert!((p.value_at(0.25) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn set_target_approaches_exponentially() {
        let mut p = Param::new(1.0);
        p.set_target_at(0.0, 1.0, 0.05);
        assert!((p.value_at(1.0) - 1.0).abs() < 1e-12);
        let one_tau = p.value_at(1.05);
        assert!((one_tau - (-1.0_f64).exp()).abs() < 1e-9);
        assert!(p.value_at(2.0) < 1e-6);
    }

    #[test]
    fn events_at_equal_times_keep_insertion_order() {
        let mut p = Param::new(0.0);
        p.set_value_at(0.2, 1.0);
        p.set_value_at(0.9, 1.0);
        assert_eq!(p.value_at(1.0), 0.9);
    }

    #[test]
    fn out_of_order_inserts_are_sorted() {
        // A tiny note: the plateau hold lands before the attack ramp ends.
        let mut p = Param::new(0.0);
        p.set_value_at(0.0, 1.0);
        p.linear_ramp_to(0.3, 1.02);
        p.set_value_at(0.3, 1.001);
        p.linear_ramp_to(0.0, 1.101);
        let times: Vec<f64> = p.events().iter().map(|e| e.time()).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(p.value_at(1.05) > 0.0);
        assert_eq!(p.value_at(1.2), 0.0);
    }

    #[test]
    fn compact_preserves_future_values() {
        let mut p = Param::new(0.0);
        p.set_value_at(0.0, 0.0);
        p.linear_ramp_to(1.0, 1.0);
        p.set_target_at(0.25, 2.0, 0.1);
        p.linear_ramp_to(0.5, 4.0);

        let probes = [2.0, 2.05, 2.5, 3.0, 3.9, 4.5];
        let before: Vec<f64> = probes.iter().map(|&t| p.value_at(t)).collect();
        p.compact(2.0);
        let after: Vec<f64> = probes.iter().map(|&t| p.value_at(t)).collect();
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-12, "compaction changed a value: {a} vs {b}");
        }
        assert!(p.events().len() <= 3);
    }

    #[test]
    fn glide_bounds_event_count() {
        let mut p = Param::new(0.0);
        for i in 0..1000 {
            p.glide_to(i as f64, i as f64 * 0.01, PARAM_SMOOTHING);
        }
        assert!(p.events().len() <= 2, "got {} events", p.events().len());
    }

    #[test]
    fn fill_matches_value_at_across_events() {
        let mut p = Param::new(0.0);
        p.set_value_at(0.0, 0.001);
        p.linear_ramp_to(0.4, 0.002);
        let sr = 44100.0;
        let mut out = [0.0_f32; 128];
        p.fill(0.0, sr, &mut out);
        for (i, &v) in out.iter().enumerate() {
            let expected = p.value_at(i as f64 / sr) as f32;
            assert!((v - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn automation_serializes_with_tag() {
        let json = serde_json::to_string(&Automation::SetTarget {
            time: 1.0,
            target: 2.0,
            time_constant: 0.02,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"setTarget\""));
        assert!(json.contains("\"timeConstant\":0.02"));
    }
}
