//! Offline renderer: renders one loop of a pattern on a fresh graph and
//! encodes it as WAV.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::compiler::{CompileContext, compile_all};
use crate::config::{EngineConfig, loop_duration};
use crate::dsp::RENDER_QUANTUM;
use crate::dsp::graph::{GraphSpec, RenderGraph};
use crate::engine::instantiate;
use crate::error::{EngineError, Result};
use crate::pattern::{PatternSettings, Track, strip_gains};
use crate::rack::RackSettings;
use crate::routing::SendMatrix;

/// Exact number of frames in one exported loop.
pub fn frame_count(sample_rate: f64, bpm: f64) -> usize {
    (sample_rate * loop_duration(bpm)).round() as usize
}

/// Render one loop cycle of `tracks` on a freshly built offline graph.
///
/// Everything is compiled against loop start 0 with the rack as given; the
/// result is exactly `frame_count(config.sample_rate, bpm)` stereo frames.
pub fn render_offline(
    config: &EngineConfig,
    tracks: &[Track],
    settings: &PatternSettings,
    rack: &RackSettings,
    matrix: &SendMatrix,
) -> (Vec<f32>, Vec<f32>) {
    let sample_rate = config.sample_rate;
    let frames = frame_count(sample_rate, settings.bpm);
    let spec = GraphSpec::offline(config, sample_rate, rack);
    let mut graph = RenderGraph::new(&spec, rack, matrix, strip_gains(tracks));

    let ctx = CompileContext::new(config, settings, 0.0, rack.chaos());
    let mut voices: Vec<_> = compile_all(tracks, &ctx)
        .iter()
        .map(|event| instantiate(event, sample_rate, rack.morph()))
        .collect();

    let mut left = Vec::with_capacity(frames);
    let mut right = Vec::with_capacity(frames);
    let mut quantum_l = vec![0.0; RENDER_QUANTUM];
    let mut quantum_r = vec![0.0; RENDER_QUANTUM];
    let mut rendered = 0;
    while rendered < frames {
        let time = rendered as f64 / sample_rate;
        graph.render_quantum(time, voices.iter_mut(), &mut quantum_l, &mut quantum_r);
        let take = (frames - rendered).min(RENDER_QUANTUM);
        left.extend_from_slice(&quantum_l[..take]);
        right.extend_from_slice(&quantum_r[..take]);
        rendered += RENDER_QUANTUM;

        let end = rendered as f64 / sample_rate;
        voices.retain(|voice| !voice.is_finished(end));
    }
    (left, right)
}

// ── Export guard ────────────────────────────────────────────

/// Single-flight slot for exports. Cloning shares the slot.
#[derive(Debug, Clone, Default)]
pub struct ExportSlot {
    busy: Arc<AtomicBool>,
}

impl ExportSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot, or fail if an export is already in flight.
    pub fn try_acquire(&self) -> Result<ExportGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EngineError::ExportInProgress)?;
        Ok(ExportGuard {
            busy: Arc::clone(&self.busy),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for as long as an export is in flight; releases the slot on drop.
#[derive(Debug)]
pub struct ExportGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for ExportGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// A snapshot of everything an export needs. Owns its data, so it can be
/// rendered on another thread while the live engine keeps playing.
#[derive(Debug)]
pub struct ExportJob {
    config: EngineConfig,
    tracks: Vec<Track>,
    settings: PatternSettings,
    rack: RackSettings,
    matrix: SendMatrix,
    _guard: ExportGuard,
}

impl ExportJob {
    pub fn new(
        config: EngineConfig,
        tracks: Vec<Track>,
        settings: PatternSettings,
        rack: RackSettings,
        matrix: SendMatrix,
        guard: ExportGuard,
    ) -> Self {
        ExportJob {
            config,
            tracks,
            settings,
            rack,
            matrix,
            _guard: guard,
        }
    }

    pub fn frame_count(&self) -> usize {
        frame_count(self.config.sample_rate, self.settings.bpm)
    }

    pub fn render(&self) -> (Vec<f32>, Vec<f32>) {
        info!(frames = self.frame_count(), sample_rate = self.config.sample_rate, "export started");
        let out = render_offline(
            &self.config,
            &self.tracks,
            &self.settings,
            &self.rack,
            &self.matrix,
        );
        info!("export finished");
        out
    }

    /// Render and encode as 16-bit stereo WAV.
    pub fn to_wav(&self) -> Vec<u8> {
        let (left, right) = self.render();
        encode_wav(&left, &right, self.config.sample_rate.round() as u32)
    }
}

// ── WAV encoding ────────────────────────────────────────────

/// Float sample to 16-bit PCM: clamp, then scale negatives by 32768 and
/// positives by 32767, truncating.
pub fn to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encode two channels as an interleaved 16-bit PCM WAV byte buffer.
pub fn encode_wav(left: &[f32], right: &[f32], sample_rate: u32) -> Vec<u8> {
    let channels: u16 = 2;
    let bits_per_sample: u16 = 16;
    let frames = left.len().min(right.len());
    let byte_rate = sample_rate * channels as u32 * (bits_per_sample as u32 / 8);
    let block_align = channels * (bits_per_sample / 8);
    let data_size = (frames * channels as usize * 2) as u32;
    let file_size = 36 + data_size;

    let mut buf = Vec::with_capacity(44 + data_size as usize);

    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&bits_per_sample.to_le_bytes());

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for (&l, &r) in left.iter().zip(right) {
        buf.extend_from_slice(&to_pcm16(l).to_le_bytes());
        buf.extend_from_slice(&to_pcm16(r).to_le_bytes());
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AudioEngine;
    use crate::pattern::{Brush, ChordType, Point, Segment};
    use crate::rack::{EffectKind, Parameter};
    use std::io::Cursor;

    fn config(sample_rate: f64) -> EngineConfig {
        EngineConfig {
            sample_rate,
            ..EngineConfig::default()
        }
    }

    fn drawn_tracks() -> Vec<Track> {
        let mut tracks = vec![Track::default(); 4];
        let mut line = Segment::new(Brush::Fractal, 4.0, ChordType::Major);
        line.points = vec![
            Point { x: 0.0, y: 20.0, r_x: 0.1, r_y: -0.3 },
            Point { x: 30.0, y: 60.0, r_x: -0.2, r_y: 0.4 },
        ];
        tracks[0].segments.push(line);
        let mut grains = Segment::new(Brush::Particles, 4.0, ChordType::Major);
        grains.points = vec![Point::new(10.0, 50.0), Point::new(20.0, 70.0)];
        tracks[1].segments.push(grains);
        tracks
    }

    #[test]
    fn test_frame_count_matches_loop() {
        assert_eq!(frame_count(44100.0, 120.0), 705_600);
        assert_eq!(frame_count(22050.0, 97.0), (22050.0_f64 * 60.0 / 97.0 * 32.0).round() as usize);
    }

    #[test]
    fn test_render_has_exact_length() {
        let settings = PatternSettings { bpm: 240.0, ..PatternSettings::default() };
        let (left, right) = render_offline(
            &config(8000.0),
            &drawn_tracks(),
            &settings,
            &RackSettings::default(),
            &SendMatrix::new(),
        );
        assert_eq!(left.len(), 64_000);
        assert_eq!(right.len(), 64_000);
        assert!(left.iter().any(|&s| s.abs() > 0.01));

        // The length follows the configured rate.
        let (left, _) = render_offline(
            &config(11025.0),
            &drawn_tracks(),
            &settings,
            &RackSettings::default(),
            &SendMatrix::new(),
        );
        assert_eq!(left.len(), 88_200);
    }

    #[test]
    fn test_pcm_conversion_is_asymmetric_and_clamped() {
        assert_eq!(to_pcm16(1.5), 32767);
        assert_eq!(to_pcm16(-1.5), -32768);
        assert_eq!(to_pcm16(0.5), 16383);
        assert_eq!(to_pcm16(-0.5), -16384);
        assert_eq!(to_pcm16(0.0), 0);
    }

    #[test]
    fn test_wav_header_valid() {
        let wav = encode_wav(&[0.0; 10], &[0.0; 10], 22050);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 2);
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 22050);
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 40);
        assert_eq!(wav.len(), 44 + 40);
    }

    #[test]
    fn test_wav_reads_back_through_decoder() {
        let left = [0.25_f32, -1.0, 2.0];
        let right = [0.0_f32, 0.5, -0.75];
        let wav = encode_wav(&left, &right, 8000);
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 8000);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![8191, 0, -32768, 16383, 32767, -24576]);
    }

    #[test]
    fn test_single_flight_export() {
        let slot = ExportSlot::new();
        let guard = slot.try_acquire().unwrap();
        assert!(slot.is_busy());
        assert!(matches!(slot.try_acquire(), Err(EngineError::ExportInProgress)));

        let job = ExportJob::new(
            config(8000.0),
            drawn_tracks(),
            PatternSettings::default(),
            RackSettings::default(),
            SendMatrix::new(),
            guard,
        );
        assert!(slot.is_busy());
        drop(job);
        assert!(!slot.is_busy());
        assert!(slot.try_acquire().is_ok());
    }

    #[test]
    fn test_export_job_is_send() {
        fn assert_send<T: Send + 'static>() {}
        assert_send::<ExportJob>();
    }

    #[test]
    fn test_job_wav_is_one_loop() {
        let slot = ExportSlot::new();
        let job = ExportJob::new(
            config(8000.0),
            drawn_tracks(),
            PatternSettings { bpm: 240.0, ..PatternSettings::default() },
            RackSettings::default(),
            SendMatrix::new(),
            slot.try_acquire().unwrap(),
        );
        let wav = job.to_wav();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.duration() as usize, job.frame_count());
    }

    #[test]
    fn test_live_and_offline_graphs_agree() {
        let cfg = config(8000.0);
        let tracks = drawn_tracks();
        let settings = PatternSettings::default();
        let mut rack = RackSettings::default();
        rack.set_knob(Parameter::FractalChaos, 0.6);
        rack.set_knob(Parameter::FractalMorph, 0.3);
        rack.set_knob(Parameter::ReverbMix, 0.4);
        rack.set_knob(Parameter::FilterFreq, 0.5);
        let mut matrix = SendMatrix::new();
        matrix.set_route(0, EffectKind::Reverb, true).unwrap();
        matrix.set_route(1, EffectKind::Filter, true).unwrap();
        matrix.set_route(1, EffectKind::Delay, true).unwrap();

        let frames = 8000;
        let (off_l, off_r) = render_offline(&cfg, &tracks, &settings, &rack, &matrix);

        // A live engine holding the same snapshot, playing the same cycle from time 0.
        let mut engine = AudioEngine::with_state(&cfg, rack.clone(), matrix, strip_gains(&tracks));
        let ctx = CompileContext::new(&cfg, &settings, 0.0, rack.chaos());
        for event in compile_all(&tracks, &ctx) {
            engine.schedule(&event);
        }
        engine.resume().unwrap();
        let (live_l, live_r) = engine.pull_frames(frames);

        assert_eq!(live_l, off_l[..frames]);
        assert_eq!(live_r, off_r[..frames]);
    }
}
