use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectorBackend, RawOutput};

/// Scriptable backend for tests and demos.
///
/// Each `infer` call pops the next scripted output; once the script is
/// exhausted every call yields an empty (zero-anchor) output. The input
/// buffer is still validated so pipeline plumbing bugs surface here.
pub struct StubBackend {
    input_size: u32,
    num_classes: usize,
    script: VecDeque<RawOutput>,
    calls: u64,
}

impl StubBackend {
    pub fn new(input_size: u32) -> Self {
        Self {
            input_size,
            num_classes: 1,
            script: VecDeque::new(),
            calls: 0,
        }
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes.max(1);
        self
    }

    /// Queue a raw output to be returned by the next unscripted `infer`.
    pub fn push_output(&mut self, output: RawOutput) {
        self.script.push_back(output);
    }

    /// Queue a single-box output row `[cx, cy, w, h, score]` in model-input
    /// coordinates, with zeros for all other class scores.
    pub fn push_box(&mut self, cx: f32, cy: f32, w: f32, h: f32, score: f32) {
        let mut row = vec![cx, cy, w, h];
        row.push(score);
        row.extend(std::iter::repeat(0.0).take(self.num_classes - 1));
        let output = RawOutput::new(4 + self.num_classes, row)
            .expect("stub row construction is well formed");
        self.script.push_back(output);
    }

    /// Queue an output with no detections.
    pub fn push_empty(&mut self) {
        self.script.push_back(RawOutput::empty(self.num_classes));
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn infer(&mut self, pixels: &[u8]) -> Result<RawOutput> {
        let expected = (self.input_size as usize).pow(2) * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "stub backend expected {} input bytes, received {}",
                expected,
                pixels.len()
            ));
        }
        self.calls += 1;
        Ok(self
            .script
            .pop_front()
            .unwrap_or_else(|| RawOutput::empty(self.num_classes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_outputs_come_back_in_order() {
        let mut backend = StubBackend::new(8);
        backend.push_box(4.0, 4.0, 2.0, 2.0, 0.9);
        backend.push_empty();

        let input = vec![0u8; 8 * 8 * 3];
        assert_eq!(backend.infer(&input).unwrap().num_rows(), 1);
        assert_eq!(backend.infer(&input).unwrap().num_rows(), 0);
        // Script exhausted: still empty, never an error.
        assert_eq!(backend.infer(&input).unwrap().num_rows(), 0);
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn wrong_input_length_is_rejected() {
        let mut backend = StubBackend::new(8);
        assert!(backend.infer(&[0u8; 7]).is_err());
    }
}
