//! Vibrato effect: pitch wobble from an LFO-modulated delay line.
//!
//! The delay time swings around a fixed base: `0.03 + sin(lfo)·depth` seconds.
//! Sweeping the read head through the buffer shifts the pitch up and down.

use std::f64::consts::PI;

use super::delay::read_interpolated;
use super::param::Param;

/// Centre of the modulated delay, in seconds.
pub const BASE_DELAY: f64 = 0.03;

#[derive(Debug, Clone)]
pub struct Vibrato {
    buffer: Vec<f32>,
    write_pos: usize,
    sample_rate: f64,
    phase: f64,
    rate_buf: Vec<f32>,
    depth_buf: Vec<f32>,

    /// LFO rate in Hz.
    pub rate: Param,
    /// Modulation depth in seconds.
    pub depth: Param,
}

impl Vibrato {
    pub fn new(sample_rate: f64, rate: f64, depth: f64) -> Self {
        // One second of history covers the base delay plus any depth.
        let buffer_size = sample_rate as usize + 2;
        Vibrato {
            buffer: vec![0.0; buffer_size],
            write_pos: 0,
            sample_rate,
            phase: 0.0,
            rate_buf: Vec::new(),
            depth_buf: Vec::new(),
            rate: Param::new(rate),
            depth: Param::new(depth),
        }
    }

    /// Process one quantum in place (wet output only).
    pub fn process(&mut self, time: f64, buf: &mut [f32]) {
        let n = buf.len();
        self.rate_buf.resize(n, 0.0);
        self.depth_buf.resize(n, 0.0);
        self.rate.fill(time, self.sample_rate, &mut self.rate_buf);
        self.depth.fill(time, self.sample_rate, &mut self.depth_buf);

        let buffer_len = self.buffer.len();
        let max_delay = (buffer_len - 1) as f64;
        for i in 0..n {
            self.buffer[self.write_pos] = buf[i];

            let lfo = (2.0 * PI * self.phase).sin();
            let delay = (BASE_DELAY + lfo * self.depth_buf[i] as f64) * self.sample_rate;
            buf[i] = read_interpolated(&self.buffer, self.write_pos, delay.clamp(1.0, max_delay));

            self.write_pos = (self.write_pos + 1) % buffer_len;
            self.phase = (self.phase + self.rate_buf[i] as f64 / self.sample_rate).fract();
        }
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
        self.phase = 0.0;
    }
}
