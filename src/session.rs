//! Session: the instrument as the host sees it.
//!
//! Owns the engine context, the four tracks, the loop clock and the pattern
//! banks. The host calls `tick()` from its periodic driver, pulls audio from
//! the engine, and forwards pointer, trace pad, knob, transport and sync
//! input.

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::bank::{BankId, KeyValueStore, MemoryStore, PatternBanks, SetDocument};
use crate::clock::{ClockEvent, ClockSource, ExternalClock, InternalClock, LoopClock, SyncMessage};
use crate::compiler::{CompileContext, VoiceEvent, compile_all};
use crate::config::{EngineConfig, TRACK_COUNT};
use crate::dsp::oscillator::Waveform;
use crate::engine::AudioEngine;
use crate::error::{EngineError, Result};
use crate::pattern::{Brush, Pen, PatternDocument, PatternSettings, Point, Segment, Track, strip_gains};
use crate::pitch::Scale;
use crate::rack::{EffectKind, Parameter, RackSettings, Unit, XyLinks};
use crate::renderer::{ExportJob, ExportSlot, encode_wav};
use crate::routing::SendMatrix;
use crate::voice_manager::VoiceManager;

/// What a bank pad press did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recall {
    Loaded,
    /// Loads at the next loop boundary.
    Queued,
    Empty,
}

/// A cycle compiled ahead of its loop start.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Cycle {
    loop_start: f64,
    bpm: f64,
}

/// A held trace pad.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Trace {
    track: usize,
    /// Pointer height in pad coordinates.
    y: f64,
    /// The pad moves linked knobs instead of drawing.
    effects: bool,
    /// Segment receiving points; `None` after it was cleared away.
    segment: Option<usize>,
}

pub struct Session {
    config: EngineConfig,
    engine: AudioEngine,
    tracks: Vec<Track>,
    settings: PatternSettings,
    clock: Box<dyn ClockSource>,
    gestures: VoiceManager,
    pen: Pen,
    /// Track with an open stroke.
    drawing: Option<usize>,
    banks: PatternBanks,
    store: Box<dyn KeyValueStore>,
    queued: Option<PatternDocument>,
    /// Rack and routing of a queued pattern, applied when its cycle begins.
    pending_fx: Option<(RackSettings, SendMatrix)>,
    ahead: Option<Cycle>,
    trace: Option<Trace>,
    xy_links: XyLinks,
    export: ExportSlot,
    rng: StdRng,
}

impl Session {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, Box::new(MemoryStore::new()))
    }

    /// A session whose banks persist in `store`.
    pub fn with_store(config: EngineConfig, store: Box<dyn KeyValueStore>) -> Self {
        let tracks = vec![Track::default(); TRACK_COUNT];
        let settings = PatternSettings::default();
        let banks = PatternBanks::load(store.as_ref());
        Session {
            engine: AudioEngine::new(&config, strip_gains(&tracks)),
            clock: Box::new(InternalClock::new(LoopClock::new(settings.bpm))),
            rng: StdRng::seed_from_u64(config.jitter_seed),
            config,
            tracks,
            settings,
            gestures: VoiceManager::new(),
            pen: Pen {
                thickness: 4.0,
                ..Pen::default()
            },
            drawing: None,
            banks,
            store,
            queued: None,
            pending_fx: None,
            ahead: None,
            trace: None,
            xy_links: XyLinks::default(),
            export: ExportSlot::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &AudioEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut AudioEngine {
        &mut self.engine
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn settings(&self) -> &PatternSettings {
        &self.settings
    }

    pub fn banks(&self) -> &PatternBanks {
        &self.banks
    }

    pub fn is_playing(&self) -> bool {
        self.clock.is_playing()
    }

    pub fn is_external_sync(&self) -> bool {
        self.clock.is_external()
    }

    /// Seconds into the current loop cycle.
    pub fn position(&self) -> f64 {
        self.clock.position(self.engine.current_time())
    }

    pub fn loop_duration(&self) -> f64 {
        self.clock.loop_duration()
    }

    pub fn has_queued_pattern(&self) -> bool {
        self.queued.is_some()
    }

    pub fn next_cycle_scheduled(&self) -> bool {
        self.ahead.is_some()
    }

    pub fn export_busy(&self) -> bool {
        self.export.is_busy()
    }

    /// Fill the host's output buffers.
    pub fn pull(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        self.engine.pull(out_l, out_r);
    }

    // ── Settings ────────────────────────────────────────────

    /// Takes effect from the next loop cycle.
    pub fn set_bpm(&mut self, bpm: f64) {
        self.settings.bpm = bpm;
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.settings.looping = looping;
    }

    pub fn set_scale(&mut self, scale: Scale) {
        self.settings.scale = scale;
    }

    pub fn set_harmonize(&mut self, harmonize: bool) {
        self.settings.harmonize = harmonize;
    }

    pub fn set_pen(&mut self, pen: Pen) {
        self.pen = pen;
    }

    pub fn set_parameter(&mut self, parameter: Parameter, knob: f64) {
        self.engine.set_parameter(parameter, knob);
    }

    pub fn set_route(&mut self, track: usize, effect: EffectKind, active: bool) -> Result<()> {
        self.engine.set_route(track, effect, active)
    }

    // ── Tracks ──────────────────────────────────────────────

    fn track_mut(&mut self, track: usize) -> Result<&mut Track> {
        self.tracks
            .get_mut(track)
            .ok_or(EngineError::TrackOutOfRange(track))
    }

    fn apply_volumes(&mut self) {
        self.engine.set_track_levels(strip_gains(&self.tracks));
    }

    pub fn set_volume(&mut self, track: usize, volume: f64) -> Result<()> {
        self.track_mut(track)?.vol = volume.clamp(0.0, 1.0);
        self.apply_volumes();
        Ok(())
    }

    pub fn set_mute(&mut self, track: usize, mute: bool) -> Result<()> {
        self.track_mut(track)?.mute = mute;
        self.apply_volumes();
        Ok(())
    }

    pub fn set_solo(&mut self, track: usize, solo: bool) -> Result<()> {
        self.track_mut(track)?.solo = solo;
        self.apply_volumes();
        Ok(())
    }

    pub fn set_waveform(&mut self, track: usize, wave: Waveform) -> Result<()> {
        self.track_mut(track)?.wave = wave;
        Ok(())
    }

    pub fn set_snap(&mut self, track: usize, snap: bool) -> Result<()> {
        self.track_mut(track)?.snap = snap;
        Ok(())
    }

    pub fn clear_track(&mut self, track: usize) -> Result<()> {
        self.track_mut(track)?.clear();
        if self.drawing == Some(track) {
            self.drawing = None;
            self.gestures.end(&mut self.engine);
        }
        self.detach_trace(track);
        Ok(())
    }

    /// Delete the segments of `track` near a point. Returns how many went.
    pub fn erase(&mut self, track: usize, x: f64, y: f64) -> Result<usize> {
        let erased = self.track_mut(track)?.erase_near(x, y);
        if erased > 0 {
            self.detach_trace(track);
        }
        Ok(erased)
    }

    // ── Drawing ─────────────────────────────────────────────

    fn context(&self, loop_start: f64) -> CompileContext {
        CompileContext::new(&self.config, &self.settings, loop_start, self.engine.rack().chaos())
    }

    /// Pointer down on a track: open a stroke and start its live voice.
    pub fn stroke_begin(&mut self, track: usize, x: f64, y: f64) -> Result<Point> {
        if track >= self.tracks.len() {
            return Err(EngineError::TrackOutOfRange(track));
        }
        self.stroke_end();
        self.trace_end();

        let grid_step = self.config.grid_step();
        let point = self.tracks[track].begin_stroke(x, y, self.pen, grid_step, &mut self.rng);
        let ctx = self.context(self.clock.loop_clock().loop_start());
        let gain = strip_gains(&self.tracks)[track];
        self.gestures.begin(
            &mut self.engine,
            &ctx,
            track,
            &self.tracks[track],
            gain,
            self.pen,
            point.x,
            point.y,
        );
        self.drawing = Some(track);
        Ok(point)
    }

    /// Pointer move. Returns the point added to the stroke, if any.
    pub fn stroke_move(&mut self, x: f64, y: f64) -> Option<Point> {
        let track = self.drawing?;
        let grid_step = self.config.grid_step();
        let point = self.tracks[track].extend_stroke(x, y, grid_step, &mut self.rng);
        let ctx = self.context(self.clock.loop_clock().loop_start());
        let x = point.map_or(x, |p| p.x);
        self.gestures
            .update(&mut self.engine, &ctx, &self.tracks[track], x, y);
        point
    }

    /// Pointer up: commit the stroke and release its voice.
    pub fn stroke_end(&mut self) -> bool {
        let Some(track) = self.drawing.take() else {
            return false;
        };
        self.gestures.end(&mut self.engine);
        self.tracks[track].end_stroke()
    }

    // ── Transport ───────────────────────────────────────────

    /// Compile every track for the cycle starting at `loop_start`, with the
    /// chaos that cycle will play under.
    pub fn compile_cycle(&self, loop_start: f64) -> Vec<VoiceEvent> {
        let rack = self
            .pending_fx
            .as_ref()
            .map_or(self.engine.rack(), |(rack, _)| rack);
        let ctx = CompileContext::new(&self.config, &self.settings, loop_start, rack.chaos());
        compile_all(&self.tracks, &ctx)
    }

    fn schedule_cycle(&mut self, loop_start: f64) -> usize {
        let events = self.compile_cycle(loop_start);
        let scheduled = events
            .iter()
            .filter(|event| self.engine.schedule(event).is_some())
            .count();
        debug!(loop_start, voices = scheduled, "cycle scheduled");
        scheduled
    }

    pub fn play(&mut self) -> Result<()> {
        if self.is_playing() {
            return Ok(());
        }
        self.engine.resume()?;
        let at = self.engine.current_time() + self.config.start_delay;
        self.start_at(at);
        Ok(())
    }

    fn start_at(&mut self, at: f64) {
        self.apply_volumes();
        let clock = self.clock.loop_clock_mut();
        clock.set_bpm(self.settings.bpm);
        clock.start(at);
        self.ahead = None;
        let voices = self.schedule_cycle(at);
        info!(bpm = self.settings.bpm, voices, "playback started");
    }

    /// Stop playback and silence every voice at once.
    pub fn stop(&mut self) {
        self.clock.loop_clock_mut().stop();
        let voices = self.engine.stop_all();
        self.gestures.reset();
        self.trace = None;
        self.ahead = None;
        self.queued = None;
        self.apply_pending_fx();
        info!(voices, "playback stopped");
    }

    /// Advance the session. Call from the host's periodic driver; returns
    /// what the clock reported.
    pub fn tick(&mut self) -> Vec<ClockEvent> {
        let now = self.engine.current_time();
        let events = self.clock.poll(now);
        for event in &events {
            match *event {
                ClockEvent::Start => self.start_from_sync(),
                ClockEvent::Stop => {
                    if self.is_playing() {
                        self.stop();
                    }
                }
                ClockEvent::BpmChange(bpm) => self.settings.bpm = bpm,
                ClockEvent::LoopWrap { loop_start } => self.on_wrap(loop_start),
            }
        }
        if let Some(trace) = self.trace {
            self.trace_step(trace);
        }

        if self.is_playing() && self.settings.looping && self.ahead.is_none() {
            let next = self.clock.loop_clock().next_loop_start();
            if next - now <= self.config.schedule_ahead {
                self.queue_pending();
                let voices = self.schedule_cycle(next);
                debug!(next, voices, "next cycle compiled ahead");
                self.ahead = Some(Cycle {
                    loop_start: next,
                    bpm: self.settings.bpm,
                });
            }
        }
        events
    }

    fn start_from_sync(&mut self) {
        if self.is_playing() {
            return;
        }
        if let Err(e) = self.engine.resume() {
            warn!("cannot follow external start: {e}");
            return;
        }
        let now = self.engine.current_time();
        self.start_at(now);
    }

    fn on_wrap(&mut self, loop_start: f64) {
        if !self.is_playing() {
            return;
        }
        match self.ahead.take() {
            Some(cycle) if (cycle.loop_start - loop_start).abs() < 1e-9 => {
                self.clock.loop_clock_mut().set_bpm(cycle.bpm);
                self.apply_pending_fx();
                self.split_trace();
                debug!(loop_start, "loop wrapped");
            }
            _ => {
                self.queue_pending();
                self.apply_pending_fx();
                if self.settings.looping {
                    self.clock.loop_clock_mut().set_bpm(self.settings.bpm);
                    let voices = self.schedule_cycle(loop_start);
                    self.split_trace();
                    warn!(loop_start, voices, "cycle scheduled late");
                } else {
                    self.clock.loop_clock_mut().stop();
                    info!("playback finished");
                }
            }
        }
    }

    // ── Documents ───────────────────────────────────────────

    /// The current pattern as a document.
    pub fn document(&self) -> PatternDocument {
        PatternDocument::capture(&self.settings, self.engine.rack(), self.engine.matrix(), &self.tracks)
    }

    /// Load a pattern. Sections the document leaves out keep their state;
    /// tracks are replaced by index and keep their solo flag.
    pub fn load_document(&mut self, document: PatternDocument) {
        if let Some(settings) = document.settings {
            self.settings = settings;
        }
        if let Some(fx) = &document.fx {
            let mut rack = self.engine.rack().clone();
            let mut matrix = *self.engine.matrix();
            fx.apply(&mut rack, &mut matrix);
            self.engine.load_state(rack, matrix);
        }
        if self.drawing.is_some_and(|t| t < document.tracks.len()) {
            self.drawing = None;
            self.gestures.end(&mut self.engine);
        }
        let loaded_tracks = document.tracks.len();
        for (current, mut loaded) in self.tracks.iter_mut().zip(document.tracks) {
            loaded.solo = current.solo;
            *current = loaded;
        }
        for track in 0..loaded_tracks.min(self.tracks.len()) {
            self.detach_trace(track);
        }
        self.apply_volumes();
    }

    /// Load a pattern from JSON. Malformed input is logged and ignored.
    pub fn load_json(&mut self, json: &str) {
        self.load_document(PatternDocument::from_json_lossy(json));
    }

    /// Load the tracks and settings of a queued pattern so its cycle can be
    /// compiled. Its rack and routing wait in `pending_fx` for the wrap.
    fn queue_pending(&mut self) {
        let Some(mut document) = self.queued.take() else {
            return;
        };
        if let Some(fx) = document.fx.take() {
            let mut rack = self.engine.rack().clone();
            let mut matrix = *self.engine.matrix();
            fx.apply(&mut rack, &mut matrix);
            self.pending_fx = Some((rack, matrix));
        }
        debug!("queued pattern loaded");
        self.load_document(document);
    }

    fn apply_pending_fx(&mut self) {
        if let Some((rack, matrix)) = self.pending_fx.take() {
            self.engine.load_state(rack, matrix);
        }
    }

    /// The current pattern together with every bank.
    pub fn export_set(&self) -> Result<String> {
        SetDocument {
            current: Some(self.document()),
            banks: Some(self.banks.clone()),
        }
        .to_json()
    }

    /// Load a set, or a bare pattern document. Imported banks replace the
    /// stored ones.
    pub fn import_set(&mut self, json: &str) -> Result<()> {
        let set = SetDocument::from_json(json)?;
        if let Some(banks) = set.banks {
            self.banks = banks;
            self.banks.save(self.store.as_mut())?;
        }
        if let Some(current) = set.current {
            self.load_document(current);
        }
        Ok(())
    }

    // ── Banks ───────────────────────────────────────────────

    /// Save the current pattern into a slot and persist the banks.
    pub fn store_pattern(&mut self, bank: BankId, slot: usize) -> Result<()> {
        let document = self.document();
        self.banks.store(bank, slot, document)?;
        self.banks.save(self.store.as_mut())
    }

    /// Load a slot now when stopped, or at the next loop boundary when playing.
    pub fn recall(&mut self, bank: BankId, slot: usize) -> Result<Recall> {
        let Some(document) = self.banks.get(bank, slot)?.cloned() else {
            return Ok(Recall::Empty);
        };
        if self.is_playing() {
            self.queued = Some(document);
            Ok(Recall::Queued)
        } else {
            self.load_document(document);
            Ok(Recall::Loaded)
        }
    }

    // ── Trace pad ───────────────────────────────────────────

    pub fn is_tracing(&self) -> bool {
        self.trace.is_some()
    }

    /// Playhead as a canvas x coordinate; `None` unless a cycle is running.
    fn playhead_x(&self) -> Option<f64> {
        if !self.is_playing() {
            return None;
        }
        let position = self.position();
        (position >= 0.0).then(|| position / self.loop_duration() * self.config.canvas_width)
    }

    /// Hold the trace pad for `track`, with the pointer at height `y`.
    ///
    /// Only works while playing. When any panel is XY-linked the pad moves
    /// the linked knobs; otherwise every tick writes a point to `track` at
    /// the playhead and the track plays live. Returns whether a trace began.
    pub fn trace_begin(&mut self, track: usize, y: f64) -> Result<bool> {
        if track >= self.tracks.len() {
            return Err(EngineError::TrackOutOfRange(track));
        }
        let Some(x) = self.playhead_x() else {
            return Ok(false);
        };
        self.stroke_end();
        self.trace_end();

        if self.xy_links.any() {
            self.trace = Some(Trace {
                track,
                y,
                effects: true,
                segment: None,
            });
            return Ok(true);
        }

        let segment = self.open_trace_segment(track);
        let point = Point::with_jitter(x, y, &mut self.rng);
        self.tracks[track].segments[segment].points.push(point);
        let ctx = self.context(self.clock.loop_clock().loop_start());
        let gain = strip_gains(&self.tracks)[track];
        self.gestures.begin(
            &mut self.engine,
            &ctx,
            track,
            &self.tracks[track],
            gain,
            self.pen,
            x,
            y,
        );
        self.trace = Some(Trace {
            track,
            y,
            effects: false,
            segment: Some(segment),
        });
        Ok(true)
    }

    /// Pointer move on the held pad. Points are written by `tick()`; here
    /// the live voice follows the pointer.
    pub fn trace_move(&mut self, x: f64, y: f64) -> bool {
        let Some(trace) = self.trace.as_mut() else {
            return false;
        };
        trace.y = y;
        let trace = *trace;
        if !trace.effects && self.pen.brush != Brush::Particles {
            let ctx = self.context(self.clock.loop_clock().loop_start());
            self.gestures
                .update(&mut self.engine, &ctx, &self.tracks[trace.track], x, y);
        }
        true
    }

    /// Release the trace pad.
    pub fn trace_end(&mut self) -> bool {
        let Some(trace) = self.trace.take() else {
            return false;
        };
        if !trace.effects {
            self.gestures.end(&mut self.engine);
        }
        true
    }

    /// Empty `track`. A trace held on it keeps running and starts writing
    /// again at the next loop.
    pub fn trace_clear(&mut self, track: usize) -> Result<()> {
        self.track_mut(track)?.segments.clear();
        self.detach_trace(track);
        Ok(())
    }

    fn open_trace_segment(&mut self, track: usize) -> usize {
        let segments = &mut self.tracks[track].segments;
        segments.push(Segment::new(self.pen.brush, self.pen.thickness, self.pen.chord));
        segments.len() - 1
    }

    /// Stop writing into a segment that was removed from under the trace.
    fn detach_trace(&mut self, track: usize) {
        if let Some(trace) = self.trace.as_mut().filter(|t| t.track == track) {
            trace.segment = None;
        }
    }

    /// A held trace writes each loop into a fresh segment.
    fn split_trace(&mut self) {
        let Some(track) = self.trace.filter(|t| !t.effects).map(|t| t.track) else {
            return;
        };
        let segment = self.open_trace_segment(track);
        if let Some(trace) = self.trace.as_mut() {
            trace.segment = Some(segment);
        }
    }

    fn trace_step(&mut self, trace: Trace) {
        let Some(x) = self.playhead_x() else {
            return;
        };
        if trace.effects {
            let norm_x = x / self.config.canvas_width;
            let norm_y = 1.0 - trace.y / self.config.pad_height;
            self.xy_control(norm_x, norm_y);
            return;
        }

        let point = Point::with_jitter(x, trace.y, &mut self.rng);
        let Some(segment) = trace
            .segment
            .and_then(|i| self.tracks[trace.track].segments.get_mut(i))
        else {
            return;
        };
        segment.points.push(point);
        if self.pen.brush == Brush::Particles {
            let ctx = self.context(self.clock.loop_clock().loop_start());
            self.gestures
                .update(&mut self.engine, &ctx, &self.tracks[trace.track], x, trace.y);
        }
    }

    // ── XY pad ──────────────────────────────────────────────

    pub fn set_xy_link(&mut self, unit: Unit, linked: bool) {
        self.xy_links.set(unit, linked);
    }

    pub fn xy_links(&self) -> &XyLinks {
        &self.xy_links
    }

    /// Move the knobs of every linked panel to a normalized pad position:
    /// x drives the panel's first knob, y its second. Returns how many
    /// knobs moved.
    pub fn xy_control(&mut self, norm_x: f64, norm_y: f64) -> usize {
        let links = self.xy_links;
        let mut moved = 0;
        for unit in links.linked() {
            let (x_knob, y_knob) = unit.xy_parameters();
            self.engine.set_parameter(x_knob, norm_x);
            self.engine.set_parameter(y_knob, norm_y);
            moved += 2;
        }
        moved
    }

    // ── Recording ───────────────────────────────────────────

    /// Start recording the master output, resuming the engine if needed.
    pub fn start_recording(&mut self) -> Result<()> {
        self.engine.resume()?;
        if !self.engine.is_recording() {
            self.engine.start_recording();
        }
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.engine.is_recording()
    }

    /// Stop recording and encode the capture as 16-bit stereo WAV. `None`
    /// when nothing was recording.
    pub fn stop_recording(&mut self) -> Option<Vec<u8>> {
        let (left, right) = self.engine.stop_recording()?.into_channels();
        Some(encode_wav(&left, &right, self.config.sample_rate.round() as u32))
    }

    // ── External sync ───────────────────────────────────────

    /// Switch between the internal clock and an external sync source. The
    /// loop position carries over.
    pub fn set_external_sync(&mut self, enabled: bool) {
        if self.clock.is_external() == enabled {
            return;
        }
        let clock = self.clock.loop_clock().clone();
        self.clock = if enabled {
            Box::new(ExternalClock::new(clock))
        } else {
            Box::new(InternalClock::new(clock))
        };
        info!(enabled, "external sync");
    }

    /// Feed one sync message. Reactions happen on the next `tick()`.
    pub fn handle_sync(&mut self, message: SyncMessage) {
        self.clock.handle(message);
    }

    // ── Export ──────────────────────────────────────────────

    /// Snapshot the pattern for an offline render. Fails when the audio
    /// context cannot run or another export is in flight.
    pub fn prepare_export(&mut self) -> Result<ExportJob> {
        self.engine.resume()?;
        let guard = self.export.try_acquire().inspect_err(|_| {
            warn!("export rejected: another export is in progress");
        })?;
        Ok(ExportJob::new(
            self.config.clone(),
            self.tracks.clone(),
            self.settings.clone(),
            self.engine.rack().clone(),
            *self.engine.matrix(),
            guard,
        ))
    }
}
