//! DSP: sample-level synthesis and effect processing.
//!
//! Everything here runs in fixed render quanta against a context clock in
//! seconds. The live engine and the offline exporter drive the same code.

pub mod convolver;
pub mod delay;
pub mod filter;
pub mod graph;
pub mod mixer;
pub mod oscillator;
pub mod param;
pub mod recorder;
pub mod reverb;
pub mod shaper;
pub mod stutter;
pub mod vibrato;
pub mod voice;

/// Frames rendered per processing step.
pub const RENDER_QUANTUM: usize = 128;
