use serde::Serialize;

/// One decoded detection, in original-frame pixel coordinates.
///
/// Invariants maintained by the decode stage: `x1 < x2`, `y1 < y2`, and
/// `confidence` lies in `(inference_threshold, 1]`.
#[derive(Clone, Debug, Serialize)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: usize,
}

impl Detection {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }
}
