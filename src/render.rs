//! Detection overlay rendering.
//!
//! The render stage runs at its own cadence: it takes the latest enhanced
//! frame and the latest detection list from the store and composes the
//! `annotated` slot. The boxes drawn may be a capture-cycle or two older
//! than the frame underneath them; that staleness is bounded by the
//! detection cadence and is the accepted price of a smooth live view.
//!
//! Each box gets a 2 px border in a confidence-dependent color (warm red
//! strictly above the high-confidence threshold, yellow at or below) and a
//! filled band above it carrying a `"{class} {confidence}"` text label.

use ab_glyph::{FontRef, PxScale};
use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::detect::Detection;
use crate::frame::Frame;

/// Boxes strictly above this confidence get the warm "alarm" color.
pub const HIGH_CONFIDENCE: f32 = 0.85;

const WARM: [u8; 3] = [220, 40, 40];
const COOL: [u8; 3] = [240, 200, 40];
const TEXT: [u8; 3] = [255, 255, 255];
const BORDER_PX: i64 = 2;

const LABEL_FONT_SIZE: f32 = 14.0;
const LABEL_HEIGHT: i64 = 16;
/// Rough per-character advance at `LABEL_FONT_SIZE`, for sizing the band.
const LABEL_CHAR_WIDTH: f32 = 8.0;
const LABEL_TEXT_PADDING: i64 = 1;

const FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Draw the detection list onto a copy of the frame.
pub fn annotate(frame: &Frame, detections: &[Detection], high_confidence: f32) -> Result<Frame> {
    let (w, h) = (frame.width() as i64, frame.height() as i64);
    let mut image = RgbImage::from_raw(frame.width(), frame.height(), frame.pixels().to_vec())
        .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
    let font = FontRef::try_from_slice(FONT_DATA)
        .map_err(|_| anyhow!("embedded label font failed to parse"))?;

    for det in detections {
        let color = if det.confidence > high_confidence {
            WARM
        } else {
            COOL
        };

        let x1 = (det.x1.floor() as i64).clamp(0, w - 1);
        let y1 = (det.y1.floor() as i64).clamp(0, h - 1);
        let x2 = (det.x2.ceil() as i64).clamp(0, w - 1);
        let y2 = (det.y2.ceil() as i64).clamp(0, h - 1);
        if x1 >= x2 || y1 >= y2 {
            continue;
        }

        draw_rect(&mut image, x1, y1, x2, y2, color);
        draw_label(&mut image, &font, det, x1, y1, color);
    }

    frame.with_pixels(image.into_raw())
}

fn put(image: &mut RgbImage, x: i64, y: i64, color: [u8; 3]) {
    if x < 0 || y < 0 || x >= image.width() as i64 || y >= image.height() as i64 {
        return;
    }
    image.put_pixel(x as u32, y as u32, Rgb(color));
}

fn draw_rect(image: &mut RgbImage, x1: i64, y1: i64, x2: i64, y2: i64, color: [u8; 3]) {
    for t in 0..BORDER_PX {
        let (xa, ya) = (x1 + t, y1 + t);
        let (xb, yb) = ((x2 - t).max(xa), (y2 - t).max(ya));
        for x in xa..=xb {
            put(image, x, ya, color);
            put(image, x, yb, color);
        }
        for y in ya..=yb {
            put(image, xa, y, color);
            put(image, xb, y, color);
        }
    }
}

/// Filled label band above the box carrying white `"{class} {confidence}"`
/// text. Skipped when the band has no room at the image edge.
fn draw_label(
    image: &mut RgbImage,
    font: &FontRef,
    det: &Detection,
    x1: i64,
    y1: i64,
    color: [u8; 3],
) {
    let text = format!("{} {:.2}", det.class_id, det.confidence);

    let band_x = x1.max(0);
    let band_y = (y1 - LABEL_HEIGHT).max(0);
    let text_width = (text.len() as f32 * LABEL_CHAR_WIDTH) as i64;
    let band_w = text_width.min(image.width() as i64 - band_x);
    if band_w <= 0 {
        return;
    }

    let rect = Rect::at(band_x as i32, band_y as i32).of_size(band_w as u32, LABEL_HEIGHT as u32);
    draw_filled_rect_mut(image, rect, Rgb(color));
    draw_text_mut(
        image,
        Rgb(TEXT),
        band_x as i32,
        (band_y + LABEL_TEXT_PADDING) as i32,
        PxScale::from(LABEL_FONT_SIZE),
        font,
        &text,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::from_rgb(vec![0u8; 64 * 64 * 3], 64, 64, 1).unwrap()
    }

    fn det(confidence: f32) -> Detection {
        Detection {
            x1: 20.0,
            y1: 20.0,
            x2: 40.0,
            y2: 40.0,
            confidence,
            class_id: 0,
        }
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * frame.width() + x) as usize) * 3;
        let p = &frame.pixels()[idx..idx + 3];
        [p[0], p[1], p[2]]
    }

    #[test]
    fn no_detections_leaves_pixels_untouched() {
        let frame = frame();
        let out = annotate(&frame, &[], HIGH_CONFIDENCE).unwrap();
        assert_eq!(out.pixels(), frame.pixels());
    }

    #[test]
    fn box_edge_is_drawn_in_confidence_color() {
        let out = annotate(&frame(), &[det(0.9)], HIGH_CONFIDENCE).unwrap();
        assert_eq!(pixel(&out, 20, 20), WARM);
        assert_eq!(pixel(&out, 40, 30), WARM);
        // Interior stays black.
        assert_eq!(pixel(&out, 30, 30), [0, 0, 0]);
    }

    #[test]
    fn low_confidence_uses_cool_color() {
        let out = annotate(&frame(), &[det(0.7)], HIGH_CONFIDENCE).unwrap();
        assert_eq!(pixel(&out, 20, 20), COOL);
    }

    #[test]
    fn exactly_at_threshold_stays_cool() {
        let out = annotate(&frame(), &[det(HIGH_CONFIDENCE)], HIGH_CONFIDENCE).unwrap();
        assert_eq!(pixel(&out, 20, 20), COOL);

        let just_above = det(HIGH_CONFIDENCE + f32::EPSILON * 4.0);
        let out = annotate(&frame(), &[just_above], HIGH_CONFIDENCE).unwrap();
        assert_eq!(pixel(&out, 20, 20), WARM);
    }

    #[test]
    fn label_band_is_rendered_above_the_box() {
        let out = annotate(&frame(), &[det(0.9)], HIGH_CONFIDENCE).unwrap();
        // The band fills rows y1-16..y1 starting at x1; a pixel inside it is
        // either the band color or white glyph text, never the background.
        for y in 5..19 {
            assert_ne!(
                pixel(&out, 21, y),
                [0, 0, 0],
                "row {} should be inside the label band",
                y
            );
        }
        // The white "0 0.90" text lightened at least one band pixel.
        let mut saw_text = false;
        for y in 4..20 {
            for x in 20..60 {
                let p = pixel(&out, x, y);
                if p[0] > 200 && p[1] > 200 && p[2] > 200 {
                    saw_text = true;
                }
            }
        }
        assert!(saw_text, "label text should be drawn on the band");
    }

    #[test]
    fn label_is_clamped_at_the_top_edge() {
        let top = Detection {
            x1: 10.0,
            y1: 0.0,
            x2: 30.0,
            y2: 20.0,
            confidence: 0.9,
            class_id: 0,
        };
        annotate(&frame(), &[top], HIGH_CONFIDENCE).unwrap();
    }

    #[test]
    fn out_of_bounds_boxes_are_clamped_not_fatal() {
        let dets = vec![
            Detection {
                x1: -50.0,
                y1: -50.0,
                x2: 10.0,
                y2: 10.0,
                confidence: 0.9,
                class_id: 0,
            },
            Detection {
                x1: 60.0,
                y1: 60.0,
                x2: 500.0,
                y2: 500.0,
                confidence: 0.9,
                class_id: 0,
            },
        ];
        annotate(&frame(), &dets, HIGH_CONFIDENCE).unwrap();
    }

    #[test]
    fn annotated_frame_keeps_capture_metadata() {
        let frame = frame();
        let out = annotate(&frame, &[det(0.9)], HIGH_CONFIDENCE).unwrap();
        assert_eq!(out.seq, frame.seq);
        assert_eq!(out.timestamp_ms, frame.timestamp_ms);
    }
}
