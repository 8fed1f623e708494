//! Contrast enhancement for murky underwater frames.
//!
//! CLAHE (contrast-limited adaptive histogram equalization) applied to the
//! lightness channel of the Lab color space: the frame is converted to Lab,
//! the L channel is equalized per tile with a clip limit and bilinear
//! blending between neighboring tile mappings, and the result is converted
//! back to RGB with chroma untouched. Operating on lightness only keeps
//! colors stable while pulling detail out of low-contrast scenes.

use anyhow::Result;

use crate::frame::{Frame, RGB_CHANNELS};

pub const DEFAULT_CLIP_LIMIT: f32 = 3.0;
pub const DEFAULT_TILE_GRID: u32 = 8;

const HIST_BINS: usize = 256;

/// CLAHE operator. Cheap to construct, so the capture stage rebuilds it
/// whenever the runtime-adjustable clip limit changes.
#[derive(Clone, Copy, Debug)]
pub struct Clahe {
    clip_limit: f32,
    tile_grid: u32,
}

impl Clahe {
    pub fn new(clip_limit: f32, tile_grid: u32) -> Self {
        Self {
            clip_limit: clip_limit.max(0.0),
            tile_grid: tile_grid.max(1),
        }
    }

    pub fn clip_limit(&self) -> f32 {
        self.clip_limit
    }

    /// Enhance a frame, returning a new frame with the same capture
    /// metadata (same seq/timestamp, derived pixels).
    pub fn apply(&self, frame: &Frame) -> Result<Frame> {
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let pixels = frame.pixels();

        // Split into lightness (0..255) plus per-pixel chroma.
        let mut lightness = vec![0u8; w * h];
        let mut chroma = vec![(0.0f32, 0.0f32); w * h];
        for (i, px) in pixels.chunks_exact(RGB_CHANNELS).enumerate() {
            let (l, a, b) = rgb_to_lab(px[0], px[1], px[2]);
            lightness[i] = (l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8;
            chroma[i] = (a, b);
        }

        let equalized = self.equalize(&lightness, w, h);

        let mut out = Vec::with_capacity(pixels.len());
        for i in 0..w * h {
            let l = equalized[i] as f32 * 100.0 / 255.0;
            let (a, b) = chroma[i];
            let (r, g, bl) = lab_to_rgb(l, a, b);
            out.push(r);
            out.push(g);
            out.push(bl);
        }

        frame.with_pixels(out)
    }

    /// Tile-wise clipped histogram equalization with bilinear interpolation
    /// between the four surrounding tile mappings.
    fn equalize(&self, lightness: &[u8], w: usize, h: usize) -> Vec<u8> {
        let grid = (self.tile_grid as usize).min(w).min(h).max(1);
        let tile_w = w.div_ceil(grid);
        let tile_h = h.div_ceil(grid);

        // One 256-entry mapping per tile.
        let mut luts = vec![[0u8; HIST_BINS]; grid * grid];
        for ty in 0..grid {
            for tx in 0..grid {
                let x0 = tx * tile_w;
                let y0 = ty * tile_h;
                let x1 = (x0 + tile_w).min(w);
                let y1 = (y0 + tile_h).min(h);

                let mut hist = [0u32; HIST_BINS];
                for y in y0..y1 {
                    for x in x0..x1 {
                        hist[lightness[y * w + x] as usize] += 1;
                    }
                }
                let tile_pixels = ((x1 - x0) * (y1 - y0)) as u32;
                luts[ty * grid + tx] = clipped_lut(&hist, tile_pixels, self.clip_limit);
            }
        }

        let mut out = vec![0u8; w * h];
        for y in 0..h {
            // Tile-space coordinate of the pixel row, relative to tile centers.
            let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
            let ty0 = fy.floor().clamp(0.0, (grid - 1) as f32) as usize;
            let ty1 = (ty0 + 1).min(grid - 1);
            let wy = (fy - fy.floor()).clamp(0.0, 1.0);

            for x in 0..w {
                let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
                let tx0 = fx.floor().clamp(0.0, (grid - 1) as f32) as usize;
                let tx1 = (tx0 + 1).min(grid - 1);
                let wx = (fx - fx.floor()).clamp(0.0, 1.0);

                let v = lightness[y * w + x] as usize;
                let tl = luts[ty0 * grid + tx0][v] as f32;
                let tr = luts[ty0 * grid + tx1][v] as f32;
                let bl = luts[ty1 * grid + tx0][v] as f32;
                let br = luts[ty1 * grid + tx1][v] as f32;
                let top = tl + (tr - tl) * wx;
                let bottom = bl + (br - bl) * wx;
                out[y * w + x] = (top + (bottom - top) * wy).round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }
}

impl Default for Clahe {
    fn default() -> Self {
        Self::new(DEFAULT_CLIP_LIMIT, DEFAULT_TILE_GRID)
    }
}

/// Build a tile's equalization mapping from its clipped histogram. The clip
/// limit is expressed as a multiple of the uniform bin height; clipped
/// excess is redistributed evenly across all bins before the CDF is taken.
fn clipped_lut(hist: &[u32; HIST_BINS], tile_pixels: u32, clip_limit: f32) -> [u8; HIST_BINS] {
    let mut lut = [0u8; HIST_BINS];
    if tile_pixels == 0 {
        for (i, entry) in lut.iter_mut().enumerate() {
            *entry = i as u8;
        }
        return lut;
    }

    let uniform = tile_pixels as f32 / HIST_BINS as f32;
    let limit = (clip_limit * uniform).max(1.0) as u32;

    let mut clipped = [0u32; HIST_BINS];
    let mut excess = 0u32;
    for (i, &count) in hist.iter().enumerate() {
        if count > limit {
            clipped[i] = limit;
            excess += count - limit;
        } else {
            clipped[i] = count;
        }
    }
    let bonus = excess / HIST_BINS as u32;
    let mut remainder = (excess % HIST_BINS as u32) as usize;
    for entry in clipped.iter_mut() {
        *entry += bonus;
        if remainder > 0 {
            *entry += 1;
            remainder -= 1;
        }
    }

    let mut cdf = 0u64;
    for (i, &count) in clipped.iter().enumerate() {
        cdf += count as u64;
        lut[i] = ((cdf * 255) / tile_pixels as u64).min(255) as u8;
    }
    lut
}

// ----------------------------------------------------------------------------
// sRGB <-> Lab (D65)
// ----------------------------------------------------------------------------

const WHITE_X: f32 = 0.950_47;
const WHITE_Z: f32 = 1.088_83;

fn srgb_to_linear(c: u8) -> f32 {
    let c = c as f32 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> u8 {
    let c = c.clamp(0.0, 1.0);
    let c = if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    };
    (c * 255.0).round().clamp(0.0, 255.0) as u8
}

fn lab_f(t: f32) -> f32 {
    const DELTA: f32 = 6.0 / 29.0;
    if t > DELTA * DELTA * DELTA {
        t.cbrt()
    } else {
        t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f32) -> f32 {
    const DELTA: f32 = 6.0 / 29.0;
    if t > DELTA {
        t * t * t
    } else {
        3.0 * DELTA * DELTA * (t - 4.0 / 29.0)
    }
}

fn rgb_to_lab(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let (rl, gl, bl) = (srgb_to_linear(r), srgb_to_linear(g), srgb_to_linear(b));
    let x = (0.4124 * rl + 0.3576 * gl + 0.1805 * bl) / WHITE_X;
    let y = 0.2126 * rl + 0.7152 * gl + 0.0722 * bl;
    let z = (0.0193 * rl + 0.1192 * gl + 0.9505 * bl) / WHITE_Z;
    let (fx, fy, fz) = (lab_f(x), lab_f(y), lab_f(z));
    (116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz))
}

fn lab_to_rgb(l: f32, a: f32, b: f32) -> (u8, u8, u8) {
    let fy = (l + 16.0) / 116.0;
    let fx = fy + a / 500.0;
    let fz = fy - b / 200.0;
    let x = lab_f_inv(fx) * WHITE_X;
    let y = lab_f_inv(fy);
    let z = lab_f_inv(fz) * WHITE_Z;
    let rl = 3.2406 * x - 1.5372 * y - 0.4986 * z;
    let gl = -0.9689 * x + 1.8758 * y + 0.0415 * z;
    let bl = 0.0557 * x - 0.2040 * y + 1.0570 * z;
    (linear_to_srgb(rl), linear_to_srgb(gl), linear_to_srgb(bl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lab_round_trip_is_close() {
        for &(r, g, b) in &[(0u8, 0u8, 0u8), (255, 255, 255), (200, 30, 60), (17, 120, 99)] {
            let (l, a, bb) = rgb_to_lab(r, g, b);
            let (r2, g2, b2) = lab_to_rgb(l, a, bb);
            assert!((r as i16 - r2 as i16).abs() <= 2, "{:?}", (r, g, b));
            assert!((g as i16 - g2 as i16).abs() <= 2, "{:?}", (r, g, b));
            assert!((b as i16 - b2 as i16).abs() <= 2, "{:?}", (r, g, b));
        }
    }

    #[test]
    fn output_keeps_frame_geometry_and_metadata() {
        let frame = Frame::from_rgb(vec![90u8; 32 * 16 * 3], 32, 16, 7).unwrap();
        let enhanced = Clahe::default().apply(&frame).unwrap();
        assert_eq!(enhanced.width(), 32);
        assert_eq!(enhanced.height(), 16);
        assert_eq!(enhanced.seq, 7);
        assert_eq!(enhanced.timestamp_ms, frame.timestamp_ms);
    }

    #[test]
    fn low_contrast_gradient_gains_contrast() {
        // Horizontal gray gradient squeezed into 100..=131.
        let (w, h) = (64u32, 32u32);
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for _y in 0..h {
            for x in 0..w {
                let v = 100 + (x / 2) as u8;
                pixels.extend_from_slice(&[v, v, v]);
            }
        }
        let frame = Frame::from_rgb(pixels, w, h, 0).unwrap();
        let enhanced = Clahe::new(4.0, 4).apply(&frame).unwrap();

        let spread = |data: &[u8]| {
            let lum: Vec<u8> = data.chunks_exact(3).map(|p| p[0]).collect();
            (*lum.iter().max().unwrap() as i16) - (*lum.iter().min().unwrap() as i16)
        };
        assert!(
            spread(enhanced.pixels()) > spread(frame.pixels()),
            "equalization should widen the lightness range"
        );
    }

    #[test]
    fn grayscale_stays_grayscale() {
        let mut pixels = Vec::new();
        for i in 0..16 * 16 {
            let v = (i % 200) as u8;
            pixels.extend_from_slice(&[v, v, v]);
        }
        let frame = Frame::from_rgb(pixels, 16, 16, 0).unwrap();
        let enhanced = Clahe::default().apply(&frame).unwrap();
        for px in enhanced.pixels().chunks_exact(3) {
            let max = *px.iter().max().unwrap() as i16;
            let min = *px.iter().min().unwrap() as i16;
            assert!(max - min <= 3, "chroma drifted: {:?}", px);
        }
    }

    #[test]
    fn extreme_clip_limits_do_not_panic() {
        let frame = Frame::from_rgb(vec![128u8; 8 * 8 * 3], 8, 8, 0).unwrap();
        Clahe::new(0.0, 8).apply(&frame).unwrap();
        Clahe::new(100.0, 1).apply(&frame).unwrap();
        Clahe::new(3.0, 64).apply(&frame).unwrap();
    }
}
