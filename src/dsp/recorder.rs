//! Master tap: captures the stereo master output while armed.

/// Stereo capture buffer fed from the end of the render graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterTap {
    left: Vec<f32>,
    right: Vec<f32>,
    /// Capture stops once this many frames are held.
    max_frames: usize,
}

impl MasterTap {
    pub fn new(max_frames: usize) -> Self {
        MasterTap {
            left: Vec::new(),
            right: Vec::new(),
            max_frames,
        }
    }

    /// Append one block of master output, up to the frame limit.
    pub fn capture(&mut self, left: &[f32], right: &[f32]) {
        let room = self.max_frames.saturating_sub(self.left.len());
        let take = left.len().min(right.len()).min(room);
        self.left.extend_from_slice(&left[..take]);
        self.right.extend_from_slice(&right[..take]);
    }

    pub fn frames(&self) -> usize {
        self.left.len()
    }

    pub fn is_full(&self) -> bool {
        self.left.len() >= self.max_frames
    }

    pub fn into_channels(self) -> (Vec<f32>, Vec<f32>) {
        (self.left, self.right)
    }
}
