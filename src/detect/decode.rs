//! Raw model output decoding: letterbox geometry, confidence filtering,
//! coordinate de-normalization and greedy non-maximum suppression.
//!
//! The detector consumes a fixed square S×S input. Frames are letterboxed
//! into it (aspect-preserving resize, centered on a neutral-gray canvas)
//! and the decode step inverts that transform so boxes land in the
//! original, unresized frame's pixel space — detections are drawn on and
//! logged against the original frame, never the padded model input.

use anyhow::{anyhow, Result};
use image::{imageops, Rgb, RgbImage};

use crate::detect::backend::RawOutput;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Neutral gray used to fill letterbox padding.
pub const LETTERBOX_FILL: u8 = 114;

/// Default IoU threshold for non-maximum suppression.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Forward letterbox mapping from an original frame into the S×S model
/// input, recorded so the decode step can invert it.
#[derive(Clone, Copy, Debug)]
pub struct Letterbox {
    /// S, the square model input edge.
    pub size: u32,
    /// `size / max(orig_w, orig_h)`.
    pub scale: f32,
    pub pad_left: u32,
    pub pad_top: u32,
    resized_w: u32,
    resized_h: u32,
}

impl Letterbox {
    pub fn compute(orig_w: u32, orig_h: u32, size: u32) -> Result<Self> {
        if orig_w == 0 || orig_h == 0 || size == 0 {
            return Err(anyhow!(
                "cannot letterbox {}x{} into {}x{}",
                orig_w,
                orig_h,
                size,
                size
            ));
        }
        let scale = size as f32 / orig_w.max(orig_h) as f32;
        let resized_w = ((orig_w as f32 * scale).round() as u32).clamp(1, size);
        let resized_h = ((orig_h as f32 * scale).round() as u32).clamp(1, size);
        Ok(Self {
            size,
            scale,
            pad_left: (size - resized_w) / 2,
            pad_top: (size - resized_h) / 2,
            resized_w,
            resized_h,
        })
    }

    /// Resize the frame preserving aspect ratio and center it on a gray
    /// S×S canvas. Returns the packed RGB input buffer for the detector.
    pub fn apply(&self, frame: &Frame) -> Result<Vec<u8>> {
        let img = RgbImage::from_raw(frame.width(), frame.height(), frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = imageops::resize(
            &img,
            self.resized_w,
            self.resized_h,
            imageops::FilterType::Triangle,
        );
        let mut canvas = RgbImage::from_pixel(
            self.size,
            self.size,
            Rgb([LETTERBOX_FILL, LETTERBOX_FILL, LETTERBOX_FILL]),
        );
        imageops::replace(
            &mut canvas,
            &resized,
            self.pad_left as i64,
            self.pad_top as i64,
        );
        Ok(canvas.into_raw())
    }
}

/// Intersection-over-Union of two boxes, in [0, 1].
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let intersection = ix * iy;
    let union = a.area() + b.area() - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Greedy non-maximum suppression across all classes.
///
/// Boxes are sorted by descending confidence with a *stable* sort, so equal
/// scores keep their decode emission order and the earlier row wins — the
/// deterministic tie-break rule for floating-point score ties. The highest
/// scoring remaining box is emitted and every remaining box whose IoU with
/// it exceeds `iou_threshold` is discarded, until none remain.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    'candidates: for det in detections {
        for winner in &kept {
            if iou(winner, &det) > iou_threshold {
                continue 'candidates;
            }
        }
        kept.push(det);
    }
    kept
}

/// Decode a raw output tensor into detections in original-frame pixels.
///
/// Per anchor row `[cx, cy, w, h, class_scores...]`:
/// 1. keep the row only when its best class score is strictly above
///    `conf_threshold`;
/// 2. convert center form to top-left form and invert the letterbox
///    transform back into original-frame coordinates;
/// 3. drop boxes that degenerate to non-positive width or height
///    (adversarial or broken model output);
/// 4. run greedy NMS over what is left.
pub fn decode_output(
    output: &RawOutput,
    letterbox: &Letterbox,
    conf_threshold: f32,
    iou_threshold: f32,
) -> Vec<Detection> {
    let mut candidates = Vec::new();

    for row in output.rows() {
        let scores = &row[4..];
        let (class_id, max_score) = argmax(scores);
        if !(max_score > conf_threshold) {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let x = (cx - w / 2.0 - letterbox.pad_left as f32) / letterbox.scale;
        let y = (cy - h / 2.0 - letterbox.pad_top as f32) / letterbox.scale;
        let w = w / letterbox.scale;
        let h = h / letterbox.scale;
        if w <= 0.0 || h <= 0.0 {
            continue;
        }

        candidates.push(Detection {
            x1: x,
            y1: y,
            x2: x + w,
            y2: y + h,
            confidence: max_score,
            class_id,
        });
    }

    if candidates.is_empty() {
        return candidates;
    }
    nms(candidates, iou_threshold)
}

/// Index and value of the highest score; ties resolve to the lowest index.
fn argmax(scores: &[f32]) -> (usize, f32) {
    let mut best_id = 0;
    let mut best = f32::NEG_INFINITY;
    for (id, &score) in scores.iter().enumerate() {
        if score > best {
            best = score;
            best_id = id;
        }
    }
    (best_id, best)
}
