#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectorBackend, RawOutput};

/// ONNX detector backend running on tract.
///
/// Loads an exported YOLO-style model with a fixed `[1, 3, S, S]` input and
/// an output of shape `[1, 4 + num_classes, num_anchors]`, which is
/// transposed here into the per-anchor row layout the decode stage expects.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>,
    input_size: u32,
}

impl TractBackend {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_size as usize, input_size as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, input_size })
    }

    fn build_input(&self, pixels: &[u8]) -> Result<Tensor> {
        let size = self.input_size as usize;
        let expected = size * size * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} letterboxed RGB bytes, received {}",
                expected,
                pixels.len()
            ));
        }

        // Packed RGB -> NCHW float, scaled to [0, 1].
        let input =
            tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
                pixels[(y * size + x) * 3 + channel] as f32 / 255.0
            });
        Ok(input.into_tensor())
    }

    fn transpose_output(&self, outputs: TVec<TValue>) -> Result<RawOutput> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }

        let row_len = shape[1];
        let num_anchors = shape[2];
        let mut data = Vec::with_capacity(row_len * num_anchors);
        for anchor in 0..num_anchors {
            for field in 0..row_len {
                data.push(view[[0, field, anchor]]);
            }
        }
        RawOutput::new(row_len, data)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn infer(&mut self, pixels: &[u8]) -> Result<RawOutput> {
        let input = self.build_input(pixels)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.transpose_output(outputs)
    }
}
