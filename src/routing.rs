//! Send matrix: which tracks feed which effect buses, and the dry-bus rule.

use serde::{Deserialize, Serialize};

use crate::config::{EFFECT_COUNT, TRACK_COUNT};
use crate::error::{EngineError, Result};
use crate::rack::EffectKind;

/// Boolean routing grid `[track][effect]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendMatrix {
    routes: [[bool; EFFECT_COUNT]; TRACK_COUNT],
}

impl SendMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_route(&mut self, track: usize, effect: EffectKind, active: bool) -> Result<()> {
        let row = self
            .routes
            .get_mut(track)
            .ok_or(EngineError::TrackOutOfRange(track))?;
        row[effect.index()] = active;
        Ok(())
    }

    pub fn is_routed(&self, track: usize, effect: EffectKind) -> bool {
        self.routes
            .get(track)
            .is_some_and(|row| row[effect.index()])
    }

    /// Whether any track feeds `effect`.
    pub fn any_active(&self, effect: EffectKind) -> bool {
        self.routes.iter().any(|row| row[effect.index()])
    }

    /// Dry level of a track.
    ///
    /// Filter routed: 0 (the filter replaces the dry path). Otherwise stutter
    /// routed: `1 − stutter_mix`. Otherwise 1.
    pub fn dry_gain(&self, track: usize, stutter_mix: f64) -> f64 {
        if self.is_routed(track, EffectKind::Filter) {
            0.0
        } else if self.is_routed(track, EffectKind::Stutter) {
            1.0 - stutter_mix
        } else {
            1.0
        }
    }

    /// Send level of a track into an effect bus.
    pub fn send_gain(&self, track: usize, effect: EffectKind, stutter_mix: f64) -> f64 {
        match (self.is_routed(track, effect), effect) {
            (false, _) => 0.0,
            (true, EffectKind::Stutter) => stutter_mix,
            (true, _) => 1.0,
        }
    }

    pub fn rows(&self) -> Vec<MatrixRow> {
        self.routes.iter().map(|&r| MatrixRow::from(r)).collect()
    }

    /// Replace the grid from document rows. Missing rows leave a track unrouted.
    pub fn from_rows(rows: &[MatrixRow]) -> Self {
        let mut matrix = SendMatrix::default();
        matrix.load_rows(rows);
        matrix
    }

    /// Overwrite the rows a document carries; later tracks keep their routes.
    pub fn load_rows(&mut self, rows: &[MatrixRow]) {
        for (row, src) in self.routes.iter_mut().zip(rows) {
            *row = src.to_array();
        }
    }
}

/// One track's row as it appears in a pattern document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixRow {
    pub delay: bool,
    pub reverb: bool,
    pub vibrato: bool,
    pub filter: bool,
    pub stutter: bool,
}

impl MatrixRow {
    pub fn get(&self, effect: EffectKind) -> bool {
        self.to_array()[effect.index()]
    }

    fn to_array(self) -> [bool; EFFECT_COUNT] {
        [self.delay, self.reverb, self.vibrato, self.filter, self.stutter]
    }
}

impl From<[bool; EFFECT_COUNT]> for MatrixRow {
    fn from(r: [bool; EFFECT_COUNT]) -> Self {
        MatrixRow {
            delay: r[0],
            reverb: r[1],
            vibrato: r[2],
            filter: r[3],
            stutter: r[4],
        }
    }
}
