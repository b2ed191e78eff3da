//! Uniformly partitioned FFT convolution (overlap-save) with zero added latency.
//!
//! The impulse is cut into `BLOCK`-sized partitions, each transformed once.
//! Every block of input is transformed once, pushed into a frequency-domain
//! delay line, and multiplied against all partitions. The last half of the
//! inverse transform is the output for the current block.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use tracing::debug;

/// Partition and processing block length (one render quantum).
pub const BLOCK: usize = super::RENDER_QUANTUM;

const FFT_SIZE: usize = BLOCK * 2;
const SPECTRUM_LEN: usize = FFT_SIZE / 2 + 1;

/// Reference level and rate used by WebAudio's impulse normalization.
const GAIN_CALIBRATION: f64 = 0.00125;
const GAIN_CALIBRATION_SAMPLE_RATE: f64 = 44100.0;
const MIN_POWER: f64 = 0.000125;

/// Mono-in, stereo-out convolver for a two-channel impulse.
pub struct Convolver {
    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    /// Per output channel, one spectrum per impulse partition.
    partitions: [Vec<Vec<Complex<f32>>>; 2],
    /// Ring of recent input spectra, newest at `head`.
    history: Vec<Vec<Complex<f32>>>,
    head: usize,
    window: Vec<f32>,
    time_scratch: Vec<f32>,
    accum: Vec<Complex<f32>>,
    silent_blocks: usize,
}

impl std::fmt::Debug for Convolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Convolver")
            .field("partitions", &self.partitions[0].len())
            .field("silent_blocks", &self.silent_blocks)
            .finish()
    }
}

impl Convolver {
    /// Build a convolver for `impulse` (left, right), normalized the way a
    /// WebAudio `ConvolverNode` normalizes its buffer.
    pub fn new(impulse: &[Vec<f32>; 2], sample_rate: f64) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let r2c = planner.plan_fft_forward(FFT_SIZE);
        let c2r = planner.plan_fft_inverse(FFT_SIZE);

        let scale = normalization_scale(impulse, sample_rate) as f32;
        // realfft leaves the inverse unscaled.
        let ifft_scale = scale / FFT_SIZE as f32;

        let mut time = r2c.make_input_vec();
        let mut partitions: [Vec<Vec<Complex<f32>>>; 2] = [Vec::new(), Vec::new()];
        for (channel, samples) in impulse.iter().enumerate() {
            for chunk in samples.chunks(BLOCK) {
                time.fill(0.0);
                for (dst, &src) in time.iter_mut().zip(chunk) {
                    *dst = src * ifft_scale;
                }
                let mut spectrum = r2c.make_output_vec();
                if r2c.process(&mut time, &mut spectrum).is_err() {
                    spectrum.fill(Complex::new(0.0, 0.0));
                }
                partitions[channel].push(spectrum);
            }
        }

        let count = partitions[0].len().max(partitions[1].len()).max(1);
        for channel in partitions.iter_mut() {
            channel.resize(count, vec![Complex::new(0.0, 0.0); SPECTRUM_LEN]);
        }
        debug!(partitions = count, "convolver built");

        Convolver {
            time_scratch: r2c.make_input_vec(),
            accum: r2c.make_output_vec(),
            history: vec![vec![Complex::new(0.0, 0.0); SPECTRUM_LEN]; count],
            head: 0,
            window: vec![0.0; FFT_SIZE],
            partitions,
            r2c,
            c2r,
            silent_blocks: count,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.history.len()
    }

    /// Convolve one block. `input`, `out_l` and `out_r` are `BLOCK` long.
    pub fn process(&mut self, input: &[f32], out_l: &mut [f32], out_r: &mut [f32]) {
        debug_assert_eq!(input.len(), BLOCK);

        let silent = input.iter().all(|&s| s == 0.0);
        self.silent_blocks = if silent { self.silent_blocks + 1 } else { 0 };
        if self.silent_blocks > self.history.len() {
            // The whole tail has drained; nothing left to convolve.
            out_l.fill(0.0);
            out_r.fill(0.0);
            return;
        }

        self.window.copy_within(BLOCK.., 0);
        self.window[BLOCK..].copy_from_slice(input);

        self.head = (self.head + 1) % self.history.len();
        self.time_scratch.copy_from_slice(&self.window);
        let newest = &mut self.history[self.head];
        if self.r2c.process(&mut self.time_scratch, newest).is_err() {
            newest.fill(Complex::new(0.0, 0.0));
        }

        let count = self.history.len();
        for (channel, out) in [out_l, out_r].into_iter().enumerate() {
            self.accum.fill(Complex::new(0.0, 0.0));
            for (p, h) in self.partitions[channel].iter().enumerate() {
                let x = &self.history[(self.head + count - p) % count];
                for ((acc, &xv), &hv) in self.accum.iter_mut().zip(x).zip(h) {
                    *acc += xv * hv;
                }
            }
            // DC and Nyquist bins of a real signal carry no imaginary part.
            self.accum[0].im = 0.0;
            self.accum[SPECTRUM_LEN - 1].im = 0.0;
            if self
                .c2r
                .process(&mut self.accum, &mut self.time_scratch)
                .is_err()
            {
                out.fill(0.0);
                continue;
            }
            out.copy_from_slice(&self.time_scratch[BLOCK..]);
        }
    }
}

fn normalization_scale(impulse: &[Vec<f32>; 2], sample_rate: f64) -> f64 {
    let len = impulse.iter().map(|c| c.len()).max().unwrap_or(0);
    if len == 0 {
        return 1.0;
    }
    let power: f64 = impulse
        .iter()
        .flat_map(|c| c.iter())
        .map(|&s| s as f64 * s as f64)
        .sum();
    let power = (power / (2.0 * len as f64)).sqrt().max(MIN_POWER);
    (1.0 / power) * GAIN_CALIBRATION * GAIN_CALIBRATION_SAMPLE_RATE / sample_rate
}
