use anyhow::{anyhow, Result};

/// Raw model output: a dense `[num_anchors, 4 + num_classes]` tensor of
/// per-anchor rows `[cx, cy, w, h, class_scores...]` in model-input
/// coordinates. Decoding back into original-frame boxes happens in
/// [`crate::detect::decode_output`].
#[derive(Clone, Debug)]
pub struct RawOutput {
    row_len: usize,
    data: Vec<f32>,
}

impl RawOutput {
    /// Wrap a flat buffer. Fails when the row length cannot describe at
    /// least one box plus one class score, or the buffer is not a whole
    /// number of rows — the malformed-output case the detection stage
    /// treats as zero detections.
    pub fn new(row_len: usize, data: Vec<f32>) -> Result<Self> {
        if row_len < 5 {
            return Err(anyhow!(
                "raw output row length {} too short for [cx, cy, w, h, scores...]",
                row_len
            ));
        }
        if data.len() % row_len != 0 {
            return Err(anyhow!(
                "raw output length {} is not a multiple of row length {}",
                data.len(),
                row_len
            ));
        }
        Ok(Self { row_len, data })
    }

    /// An output with no anchors at all (still well-formed).
    pub fn empty(num_classes: usize) -> Self {
        Self {
            row_len: 4 + num_classes.max(1),
            data: Vec::new(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.data.len() / self.row_len
    }

    pub fn num_classes(&self) -> usize {
        self.row_len - 4
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.row_len)
    }
}

/// Detector boundary: a black-box function from a letterboxed square RGB
/// input to a raw output tensor.
///
/// Implementations own their model handle exclusively; the detection stage
/// is the only caller, so `&mut self` is fine and no internal locking is
/// needed. Inference is assumed deterministic for identical input.
pub trait DetectorBackend: Send {
    /// Backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Square input edge length S; callers letterbox frames to S×S×3.
    fn input_size(&self) -> u32;

    /// Run inference on a letterboxed S×S×3 RGB buffer.
    fn infer(&mut self, pixels: &[u8]) -> Result<RawOutput>;

    /// Optional warm-up hook, called once before the detection loop starts.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_output_rejects_short_rows() {
        assert!(RawOutput::new(4, vec![0.0; 8]).is_err());
    }

    #[test]
    fn raw_output_rejects_ragged_buffers() {
        assert!(RawOutput::new(6, vec![0.0; 8]).is_err());
    }

    #[test]
    fn raw_output_row_iteration() {
        let out = RawOutput::new(5, vec![1.0, 2.0, 3.0, 4.0, 0.9, 5.0, 6.0, 7.0, 8.0, 0.1])
            .unwrap();
        assert_eq!(out.num_rows(), 2);
        assert_eq!(out.num_classes(), 1);
        let rows: Vec<&[f32]> = out.rows().collect();
        assert_eq!(rows[0][4], 0.9);
        assert_eq!(rows[1][0], 5.0);
    }
}
