//! Delay effect: a single delay line whose output is fed back into itself.

use super::param::Param;

/// Longest delay the line can hold, in seconds.
pub const MAX_DELAY_SECONDS: f64 = 5.0;

/// Mono feedback delay. Only the delayed (wet) signal is produced.
///
/// `time` and `feedback` are automatable; both are read per sample.
#[derive(Debug, Clone)]
pub struct Delay {
    buffer: Vec<f32>,
    write_pos: usize,
    sample_rate: f64,
    time_buf: Vec<f32>,
    feedback_buf: Vec<f32>,

    /// Delay time in seconds.
    pub time: Param,
    /// Gain of the tap written back into the line.
    pub feedback: Param,
}

impl Delay {
    pub fn new(sample_rate: f64, time: f64, feedback: f64) -> Self {
        let buffer_size = (sample_rate * MAX_DELAY_SECONDS) as usize + 2;
        Delay {
            buffer: vec![0.0; buffer_size],
            write_pos: 0,
            sample_rate,
            time_buf: Vec::new(),
            feedback_buf: Vec::new(),
            time: Param::new(time),
            feedback: Param::new(feedback),
        }
    }

    /// Process one quantum in place: `buf` holds the send input and receives the wet output.
    pub fn process(&mut self, time: f64, buf: &mut [f32]) {
        let n = buf.len();
        self.time_buf.resize(n, 0.0);
        self.feedback_buf.resize(n, 0.0);
        self.time.fill(time, self.sample_rate, &mut self.time_buf);
        self.feedback.fill(time, self.sample_rate, &mut self.feedback_buf);

        let max_delay = (self.buffer.len() - 1) as f64;
        for i in 0..n {
            let delay_samples = (self.time_buf[i] as f64 * self.sample_rate).clamp(1.0, max_delay);
            let delayed = read_interpolated(&self.buffer, self.write_pos, delay_samples);

            self.buffer[self.write_pos] = buf[i] + delayed * self.feedback_buf[i];
            self.write_pos = (self.write_pos + 1) % self.buffer.len();

            buf[i] = delayed;
        }
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
    }
}

/// Read `delay_samples` behind `write_pos` with linear interpolation.
#[inline]
pub(crate) fn read_interpolated(buffer: &[f32], write_pos: usize, delay_samples: f64) -> f32 {
    let buffer_len = buffer.len();
    let delay_int = delay_samples as usize;
    let frac = (delay_samples - delay_int as f64) as f32;

    let read_pos_0 = if write_pos >= delay_int {
        write_pos - delay_int
    } else {
        buffer_len - (delay_int - write_pos)
    };
    let read_pos_1 = if read_pos_0 == 0 {
        buffer_len - 1
    } else {
        read_pos_0 - 1
    };

    let s0 = buffer[read_pos_0];
    let s1 = buffer[read_pos_1];
    s0 + frac * (s1 - s0)
}
