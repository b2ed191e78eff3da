//! Pitch mapping: drawn height to frequency, and scale quantization.

use serde::{Deserialize, Serialize};

pub const MIN_FREQUENCY: f64 = 20.0;
pub const MAX_FREQUENCY: f64 = 20000.0;

/// Musical scales available for harmonization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    Minor,
    Pentatonic,
    Blues,
    #[default]
    #[serde(other)]
    Major,
}

impl Scale {
    /// Semitone offsets of each degree, in declaration order.
    pub fn degrees(self) -> &'static [i32] {
        match self {
            Scale::Major => &[0, 2, 4, 5, 7, 9, 11],
            Scale::Minor => &[0, 2, 3, 5, 7, 8, 10],
            Scale::Pentatonic => &[0, 3, 5, 7, 10],
            Scale::Blues => &[0, 3, 5, 6, 7, 10],
        }
    }

    /// Parse a scale name; unknown names fall back to major.
    pub fn from_name(name: &str) -> Scale {
        match name {
            "minor" => Scale::Minor,
            "pentatonic" => Scale::Pentatonic,
            "blues" => Scale::Blues,
            _ => Scale::Major,
        }
    }
}

/// Map a y coordinate (0 = top) to a frequency in Hz.
///
/// Linear from 1000 Hz at the top to 80 Hz at the bottom, clamped to the
/// audible range.
pub fn map_pitch(y: f64, height: f64) -> f64 {
    (1000.0 - (y / height) * 920.0).clamp(MIN_FREQUENCY, MAX_FREQUENCY)
}

/// Snap `freq` to the nearest degree of `scale` within its octave.
///
/// The note is first rounded to the nearest semitone. Among equally close
/// degrees the one declared first in the scale wins.
pub fn quantize(freq: f64, scale: Scale) -> f64 {
    let m = (69.0 + 12.0 * (freq / 440.0).log2()).round() as i64;
    let pc = m.rem_euclid(12) as i32;

    let degrees = scale.degrees();
    let mut best = degrees[0];
    let mut best_distance = i32::MAX;
    for &degree in degrees {
        let distance = (degree - pc).abs();
        if distance < best_distance {
            best_distance = distance;
            best = degree;
        }
    }

    440.0 * 2.0_f64.powf((m - pc as i64 + best as i64 - 69) as f64 / 12.0)
}

/// Quantize only when harmonization is on.
pub fn harmonize(freq: f64, enabled: bool, scale: Scale) -> f64 {
    if enabled { quantize(freq, scale) } else { freq }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALES: [Scale; 4] = [Scale::Major, Scale::Minor, Scale::Pentatonic, Scale::Blues];

    #[test]
    fn map_pitch_reference_points() {
        assert_eq!(map_pitch(0.0, 100.0), 1000.0);
        assert_eq!(map_pitch(100.0, 100.0), 80.0);
        assert_eq!(map_pitch(50.0, 100.0), 540.0);
    }

    #[test]
    fn map_pitch_is_monotonic_and_clamped() {
        let mut prev = f64::INFINITY;
        for i in -200..=400 {
            let f = map_pitch(i as f64, 100.0);
            assert!(f <= prev);
            assert!((MIN_FREQUENCY..=MAX_FREQUENCY).contains(&f));
            prev = f;
        }
        assert_eq!(map_pitch(1000.0, 100.0), 20.0);
        assert_eq!(map_pitch(-5000.0, 100.0), 20000.0);
    }

    #[test]
    fn a440_is_a_fixed_point_in_major() {
        assert!((quantize(440.0, Scale::Major) - 440.0).abs() < 1e-9);
    }

    #[test]
    fn quantize_is_idempotent() {
        for scale in SCALES {
            let mut f = 20.0;
            while f < 20000.0 {
                let q = quantize(f, scale);
                let qq = quantize(q, scale);
                assert!((q - qq).abs() < 1e-9 * q, "{scale:?}: {f} -> {q} -> {qq}");
                f *= 1.013;
            }
        }
    }

    #[test]
    fn ties_resolve_to_first_declared_degree() {
        // C#5 (MIDI 73, pitch class 1) is one semitone from both 0 and 2; 0 is declared first.
        let c_sharp5 = 440.0 * 2.0_f64.powf(4.0 / 12.0);
        let c5 = 440.0 * 2.0_f64.powf(3.0 / 12.0);
        assert!((quantize(c_sharp5, Scale::Major) - c5).abs() < 1e-9);

        // Pentatonic: pitch class 4 is 1 from 3 and 1 from 5; 3 comes first.
        let e5 = 440.0 * 2.0_f64.powf(7.0 / 12.0);
        let d_sharp5 = 440.0 * 2.0_f64.powf(6.0 / 12.0);
        assert!((quantize(e5, Scale::Pentatonic) - d_sharp5).abs() < 1e-9);
    }

    #[test]
    fn snaps_within_the_octave_only() {
        // B (pitch class 11) in pentatonic: nearest degree is 10, never the next octave's 0.
        let b4 = 440.0 * 2.0_f64.powf(2.0 / 12.0);
        let a_sharp4 = 440.0 * 2.0_f64.powf(1.0 / 12.0);
        assert!((quantize(b4, Scale::Pentatonic) - a_sharp4).abs() < 1e-9);
    }

    #[test]
    fn unknown_scale_name_is_major() {
        assert_eq!(Scale::from_name("lydian"), Scale::Major);
        let s: Scale = serde_json::from_str("\"dorian\"").unwrap();
        assert_eq!(s, Scale::Major);
    }
}
