//! Pattern data model: tracks of drawn segments, and the pattern document
//! they are saved to and loaded from.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::{DEFAULT_BPM, TRACK_COUNT};
use crate::dsp::oscillator::Waveform;
use crate::error::Result;
use crate::pitch::Scale;
use crate::rack::{Parameter, RackSettings};
use crate::routing::{MatrixRow, SendMatrix};

/// Minimum pointer travel, in pixels, before a stroke gains a new point.
pub const MIN_POINT_DISTANCE: f64 = 3.0;
/// Eraser radius in pixels.
pub const ERASE_RADIUS: f64 = 20.0;
/// Offset of the point added to single-click strokes.
pub const SINGLE_POINT_OFFSET: f64 = 0.5;

/// Horizontal and vertical jitter scale of the fractal brush at chaos 1.
const FRACTAL_SPREAD_X: f64 = 50.0;
const FRACTAL_SPREAD_Y: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Brush {
    Variable,
    Calligraphy,
    Particles,
    Fractal,
    Xenakis,
    Chord,
    #[default]
    #[serde(other)]
    Standard,
}

impl Brush {
    /// Peak envelope level of a sustained voice.
    pub fn plateau(self) -> f64 {
        match self {
            Brush::Xenakis => 0.15,
            _ => 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChordType {
    Minor,
    Diminished,
    Augmented,
    Sus2,
    Sus4,
    #[default]
    #[serde(other)]
    Major,
}

impl ChordType {
    /// Semitone offsets of the chord tones.
    pub fn intervals(self) -> &'static [i32] {
        match self {
            ChordType::Major => &[0, 4, 7],
            ChordType::Minor => &[0, 3, 7],
            ChordType::Diminished => &[0, 3, 6],
            ChordType::Augmented => &[0, 4, 8],
            ChordType::Sus2 => &[0, 2, 7],
            ChordType::Sus4 => &[0, 5, 7],
        }
    }
}

/// A drawn point. `r_x`/`r_y` are drawn once at creation and never change.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    #[serde(rename = "rX")]
    pub r_x: f64,
    #[serde(rename = "rY")]
    pub r_y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y, r_x: 0.0, r_y: 0.0 }
    }

    /// A point with fresh jitter in [-0.5, 0.5).
    pub fn with_jitter<R: Rng + ?Sized>(x: f64, y: f64, rng: &mut R) -> Self {
        Point {
            x,
            y,
            r_x: rng.gen_range(-0.5..0.5),
            r_y: rng.gen_range(-0.5..0.5),
        }
    }

    /// Position distorted by the fractal brush at `chaos`.
    pub fn perturbed(&self, chaos: f64) -> (f64, f64) {
        (
            self.x + self.r_x * FRACTAL_SPREAD_X * chaos,
            self.y + self.r_y * FRACTAL_SPREAD_Y * chaos,
        )
    }

    /// Vertical offset the fractal brush gives this point at `chaos`.
    pub fn lift(&self, chaos: f64) -> f64 {
        self.r_y * FRACTAL_SPREAD_Y * chaos
    }

    fn distance_to(&self, x: f64, y: f64) -> f64 {
        (self.x - x).hypot(self.y - y)
    }
}

fn default_thickness() -> f64 {
    4.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub points: Vec<Point>,
    #[serde(default)]
    pub brush: Brush,
    #[serde(default = "default_thickness")]
    pub thickness: f64,
    #[serde(default, rename = "chordType")]
    pub chord_type: ChordType,
}

impl Segment {
    pub fn new(brush: Brush, thickness: f64, chord_type: ChordType) -> Self {
        Segment {
            points: Vec::new(),
            brush,
            thickness,
            chord_type,
        }
    }

    /// Points as compiled: a lone point of a sustained brush gains a twin
    /// half a pixel to its right so a click still sounds.
    pub fn playable_points(&self) -> Vec<Point> {
        let mut points = self.points.clone();
        if points.len() == 1 && self.brush != Brush::Particles {
            let only = points[0];
            points.push(Point {
                x: only.x + SINGLE_POINT_OFFSET,
                ..only
            });
        }
        points
    }
}

/// Brush settings for a new stroke.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pen {
    pub brush: Brush,
    pub thickness: f64,
    pub chord: ChordType,
}

fn default_volume() -> f64 {
    0.8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default = "default_volume")]
    pub vol: f64,
    #[serde(default)]
    pub mute: bool,
    #[serde(skip)]
    pub solo: bool,
    #[serde(default)]
    pub wave: Waveform,
    #[serde(default)]
    pub snap: bool,
    #[serde(skip)]
    drawing: Option<Segment>,
}

impl Default for Track {
    fn default() -> Self {
        Track {
            segments: Vec::new(),
            vol: default_volume(),
            mute: false,
            solo: false,
            wave: Waveform::Sine,
            snap: false,
            drawing: None,
        }
    }
}

impl Track {
    fn snap_x(&self, x: f64, grid_step: f64) -> f64 {
        if self.snap && grid_step > 0.0 {
            (x / grid_step).round() * grid_step
        } else {
            x
        }
    }

    /// Start a stroke. Returns the first point after snapping.
    pub fn begin_stroke<R: Rng + ?Sized>(
        &mut self,
        x: f64,
        y: f64,
        pen: Pen,
        grid_step: f64,
        rng: &mut R,
    ) -> Point {
        let point = Point::with_jitter(self.snap_x(x, grid_step), y, rng);
        let mut segment = Segment::new(pen.brush, pen.thickness, pen.chord);
        segment.points.push(point);
        self.drawing = Some(segment);
        point
    }

    /// Extend the open stroke. Returns the new point, or `None` when there
    /// is no open stroke or the pointer has not moved far enough.
    pub fn extend_stroke<R: Rng + ?Sized>(
        &mut self,
        x: f64,
        y: f64,
        grid_step: f64,
        rng: &mut R,
    ) -> Option<Point> {
        let x = self.snap_x(x, grid_step);
        let segment = self.drawing.as_mut()?;
        let last = segment.points.last()?;
        if last.distance_to(x, y) <= MIN_POINT_DISTANCE {
            return None;
        }
        let point = Point::with_jitter(x, y, rng);
        segment.points.push(point);
        Some(point)
    }

    /// Last point of the open stroke.
    pub fn stroke_tail(&self) -> Option<&Point> {
        self.drawing.as_ref().and_then(|s| s.points.last())
    }

    pub fn is_drawing(&self) -> bool {
        self.drawing.is_some()
    }

    /// Commit the open stroke. Returns false if none was open.
    pub fn end_stroke(&mut self) -> bool {
        let Some(mut segment) = self.drawing.take() else {
            return false;
        };
        if segment.points.len() == 1 {
            segment.points = segment.playable_points();
        }
        self.segments.push(segment);
        true
    }

    /// Delete every segment with a point within the eraser radius.
    pub fn erase_near(&mut self, x: f64, y: f64) -> usize {
        let before = self.segments.len();
        self.segments
            .retain(|s| !s.points.iter().any(|p| p.distance_to(x, y) < ERASE_RADIUS));
        before - self.segments.len()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.drawing = None;
    }

    /// Audible when soloed, or when nothing is soloed and not muted.
    pub fn is_audible(&self, any_solo: bool) -> bool {
        if any_solo { self.solo } else { !self.mute }
    }
}

/// Strip gain of each track after solo/mute.
pub fn strip_gains(tracks: &[Track]) -> [f64; TRACK_COUNT] {
    let any_solo = tracks.iter().any(|t| t.solo);
    let mut gains = [0.0; TRACK_COUNT];
    for (gain, track) in gains.iter_mut().zip(tracks) {
        *gain = if track.is_audible(any_solo) { track.vol } else { 0.0 };
    }
    gains
}

/// Transport settings stored with a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSettings {
    #[serde(deserialize_with = "number_or_string")]
    pub bpm: f64,
    #[serde(rename = "loop")]
    pub looping: bool,
    pub scale: Scale,
    pub harmonize: bool,
}

impl Default for PatternSettings {
    fn default() -> Self {
        PatternSettings {
            bpm: DEFAULT_BPM,
            looping: true,
            scale: Scale::Major,
            harmonize: false,
        }
    }
}

fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Bpm {
        Number(f64),
        Text(String),
    }
    match Bpm::deserialize(deserializer)? {
        Bpm::Number(n) => Ok(n),
        Bpm::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// The `fx` section: per-unit parameter objects plus the send matrix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FxDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<Vec<MatrixRow>>,
    #[serde(flatten)]
    pub units: BTreeMap<String, Value>,
}

impl FxDocument {
    pub fn capture(rack: &RackSettings, matrix: &SendMatrix) -> Self {
        let mut units: BTreeMap<String, Value> = BTreeMap::new();
        for parameter in Parameter::ALL {
            let (unit, field) = parameter.document_key();
            let stored = rack.knob(parameter) * parameter.document_scale();
            if let Value::Object(section) = units
                .entry(unit.to_string())
                .or_insert_with(|| Value::Object(Map::new()))
            {
                section.insert(field.to_string(), Value::from(stored));
            }
        }
        FxDocument {
            matrix: Some(matrix.rows()),
            units,
        }
    }

    /// Overwrite the knobs and routes this document names. Anything it
    /// leaves out keeps its current value.
    pub fn apply(&self, rack: &mut RackSettings, matrix: &mut SendMatrix) {
        for parameter in Parameter::ALL {
            let (unit, field) = parameter.document_key();
            let Some(section) = self.units.get(unit).and_then(Value::as_object) else {
                continue;
            };
            let stored = match section.get(field).and_then(Value::as_f64) {
                Some(v) => v,
                None if parameter == Parameter::ReverbDecay => 0.5,
                None => continue,
            };
            rack.set_knob(parameter, stored / parameter.document_scale());
        }
        if let Some(rows) = &self.matrix {
            matrix.load_rows(rows);
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TrackEntry {
    Legacy(Vec<Segment>),
    Full(Track),
}

fn track_entries<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<Track>, D::Error> {
    let entries = Vec::<TrackEntry>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            TrackEntry::Legacy(segments) => Track {
                segments,
                ..Track::default()
            },
            TrackEntry::Full(track) => track,
        })
        .collect())
}

/// A saved pattern: settings, effect rack, routing and tracks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<PatternSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fx: Option<FxDocument>,
    #[serde(default, deserialize_with = "track_entries")]
    pub tracks: Vec<Track>,
}

impl PatternDocument {
    pub fn capture(
        settings: &PatternSettings,
        rack: &RackSettings,
        matrix: &SendMatrix,
        tracks: &[Track],
    ) -> Self {
        PatternDocument {
            settings: Some(settings.clone()),
            fx: Some(FxDocument::capture(rack, matrix)),
            tracks: tracks
                .iter()
                .map(|t| Track {
                    drawing: None,
                    solo: false,
                    ..t.clone()
                })
                .collect(),
        }
    }

    /// Parse a document. A bare JSON array is read as the track list.
    pub fn from_value(value: Value) -> Result<Self> {
        if value.is_array() {
            let tracks = track_entries(value)?;
            return Ok(PatternDocument {
                tracks,
                ..PatternDocument::default()
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Parse, or fall back to an empty document.
    pub fn from_json_lossy(json: &str) -> Self {
        Self::from_json(json).unwrap_or_else(|e| {
            warn!("ignoring malformed pattern document: {e}");
            PatternDocument::default()
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Tracks padded or truncated to the fixed track count.
    pub fn normalized_tracks(&self) -> Vec<Track> {
        let mut tracks = self.tracks.clone();
        tracks.resize_with(TRACK_COUNT, Track::default);
        tracks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rack::EffectKind;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn jitter_is_in_range() {
        let mut rng = rng();
        for _ in 0..1000 {
            let p = Point::with_jitter(0.0, 0.0, &mut rng);
            assert!((-0.5..0.5).contains(&p.r_x));
            assert!((-0.5..0.5).contains(&p.r_y));
        }
    }

    #[test]
    fn perturbation_scales_with_chaos() {
        let p = Point { x: 100.0, y: 50.0, r_x: 0.2, r_y: -0.4 };
        assert_eq!(p.perturbed(0.0), (100.0, 50.0));
        let (x, y) = p.perturbed(0.5);
        assert!((x - 105.0).abs() < 1e-12);
        assert!((y - 30.0).abs() < 1e-12);
    }

    #[test]
    fn stroke_ignores_small_moves() {
        let mut rng = rng();
        let mut track = Track::default();
        track.begin_stroke(10.0, 10.0, Pen::default(), 0.0, &mut rng);
        assert!(track.extend_stroke(12.0, 11.0, 0.0, &mut rng).is_none());
        assert!(track.extend_stroke(20.0, 10.0, 0.0, &mut rng).is_some());
        assert!(track.end_stroke());
        assert_eq!(track.segments[0].points.len(), 2);
        assert!(!track.end_stroke());
    }

    #[test]
    fn single_click_gets_twin_point() {
        let mut rng = rng();
        let mut track = Track::default();
        let first = track.begin_stroke(40.0, 30.0, Pen::default(), 0.0, &mut rng);
        track.end_stroke();
        let pts = &track.segments[0].points;
        assert_eq!(pts.len(), 2);
        assert_eq!(pts[1].x, 40.5);
        assert_eq!((pts[1].y, pts[1].r_x, pts[1].r_y), (first.y, first.r_x, first.r_y));
    }

    #[test]
    fn particles_keep_single_points() {
        let seg = Segment {
            points: vec![Point::new(5.0, 5.0)],
            ..Segment::new(Brush::Particles, 4.0, ChordType::Major)
        };
        assert_eq!(seg.playable_points().len(), 1);
    }

    #[test]
    fn snap_rounds_to_grid() {
        let mut rng = rng();
        let mut track = Track { snap: true, ..Track::default() };
        let step = 750.0 / 32.0;
        let p = track.begin_stroke(30.0, 0.0, Pen::default(), step, &mut rng);
        assert!((p.x - step).abs() < 1e-9);
    }

    #[test]
    fn erase_removes_touched_segments() {
        let mut track = Track::default();
        for x in [10.0, 200.0] {
            let mut s = Segment::new(Brush::Standard, 4.0, ChordType::Major);
            s.points = vec![Point::new(x, 50.0), Point::new(x + 30.0, 50.0)];
            track.segments.push(s);
        }
        assert_eq!(track.erase_near(215.0, 60.0), 1);
        assert_eq!(track.segments.len(), 1);
        assert_eq!(track.segments[0].points[0].x, 10.0);
    }

    #[test]
    fn solo_overrides_mute() {
        let mut tracks = vec![Track::default(); 4];
        tracks[1].mute = true;
        assert_eq!(strip_gains(&tracks), [0.8, 0.0, 0.8, 0.8]);
        tracks[2].solo = true;
        tracks[2].vol = 0.5;
        assert_eq!(strip_gains(&tracks), [0.0, 0.0, 0.5, 0.0]);
    }

    #[test]
    fn loads_legacy_and_string_bpm() {
        let json = r#"{
            "settings": {"bpm": "90", "loop": false, "scale": "blues", "harmonize": true},
            "tracks": [
                [{"points": [{"x": 1, "y": 2}], "brush": "fractal"}],
                {"segments": [], "mute": true}
            ]
        }"#;
        let doc = PatternDocument::from_json(json).unwrap();
        let settings = doc.settings.clone().unwrap();
        assert_eq!(settings.bpm, 90.0);
        assert!(!settings.looping);
        assert_eq!(settings.scale, Scale::Blues);
        assert_eq!(doc.tracks[0].segments[0].brush, Brush::Fractal);
        assert_eq!(doc.tracks[0].segments[0].chord_type, ChordType::Major);
        assert_eq!(doc.tracks[0].segments[0].points[0].r_x, 0.0);
        assert_eq!(doc.tracks[0].vol, 0.8);
        assert!(doc.tracks[1].mute);
        assert_eq!(doc.tracks[1].wave, Waveform::Sine);
        assert_eq!(doc.normalized_tracks().len(), 4);
    }

    #[test]
    fn bare_track_array_is_a_document() {
        let doc = PatternDocument::from_json(r#"[{"segments": [], "wave": "square"}]"#).unwrap();
        assert!(doc.settings.is_none());
        assert_eq!(doc.tracks[0].wave, Waveform::Square);
    }

    #[test]
    fn malformed_document_falls_back_to_empty() {
        let doc = PatternDocument::from_json_lossy("{\"tracks\": 5");
        assert_eq!(doc, PatternDocument::default());
    }

    #[test]
    fn fx_stores_engineering_values() {
        let mut rack = RackSettings::default();
        rack.set_knob(Parameter::ReverbMix, 0.5);
        rack.set_knob(Parameter::VibratoDepth, 0.25);
        let mut matrix = SendMatrix::new();
        matrix.set_route(2, EffectKind::Stutter, true).unwrap();

        let fx = FxDocument::capture(&rack, &matrix);
        assert_eq!(fx.units["reverb"]["mix"].as_f64(), Some(0.75));
        assert_eq!(fx.units["vibrato"]["rate"].as_f64(), Some(6.0));

        let json = serde_json::to_string(&fx).unwrap();
        let back: FxDocument = serde_json::from_str(&json).unwrap();
        let mut loaded = RackSettings::default();
        loaded.set_knob(Parameter::FilterRes, 0.9);
        let mut routes = SendMatrix::new();
        back.apply(&mut loaded, &mut routes);
        for p in Parameter::ALL {
            assert!((loaded.knob(p) - rack.knob(p)).abs() < 1e-12, "{p:?}");
        }
        assert_eq!(routes, matrix);
    }

    #[test]
    fn reverb_without_decay_defaults_to_half() {
        let fx: FxDocument = serde_json::from_str(r#"{"reverb": {"mix": 0.3}}"#).unwrap();
        let mut rack = RackSettings::default();
        let mut matrix = SendMatrix::new();
        rack.set_knob(Parameter::DelayTime, 0.9);
        fx.apply(&mut rack, &mut matrix);
        assert_eq!(rack.knob(Parameter::ReverbDecay), 0.5);
        assert!((rack.knob(Parameter::ReverbMix) - 0.2).abs() < 1e-12);
        assert_eq!(rack.knob(Parameter::DelayTime), 0.9);
    }
}
