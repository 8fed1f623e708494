use std::time::{Duration, Instant};

use anyhow::Result;

use super::{CameraConfig, CameraSource, SourceStats};
use crate::frame::Frame;

/// Synthetic camera for `stub://` URLs.
///
/// Produces a slowly varying gradient scene so downstream stages see
/// changing pixel data, paced to the configured sensor rate. Tests can
/// inject transient read failures at a fixed interval.
pub struct SyntheticSource {
    config: CameraConfig,
    frame_count: u64,
    read_failures: u64,
    scene_state: u8,
    /// Every Nth read reports a transient failure. Test hook only.
    fail_every: Option<u64>,
    last_read_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            read_failures: 0,
            scene_state: 0,
            fail_every: None,
            last_read_at: None,
        }
    }

    /// Make every `n`th read fail transiently.
    pub fn with_failures_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / self.config.target_fps as f64);
        if let Some(last) = self.last_read_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_read_at = Some(Instant::now());
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        // The scene shifts occasionally so detection-facing stages see
        // something other than a static image.
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(17);
        }
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let mut pixels = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                let base = (x * 255 / w.max(1)) as u8;
                pixels.push(base.wrapping_add(self.scene_state));
                pixels.push((y * 255 / h.max(1)) as u8);
                pixels.push((self.frame_count % 256) as u8);
            }
        }
        pixels
    }
}

impl CameraSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("camera: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        self.pace();
        if let Some(n) = self.fail_every {
            if (self.frame_count + self.read_failures + 1) % n == 0 {
                self.read_failures += 1;
                return Ok(None);
            }
        }
        let pixels = self.generate_pixels();
        let frame = Frame::from_rgb(pixels, self.config.width, self.config.height, self.frame_count)?;
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_read: self.frame_count,
            read_failures: self.read_failures,
            url: self.config.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CameraConfig {
        CameraConfig {
            url: "stub://test".into(),
            width: 32,
            height: 24,
            target_fps: 0,
        }
    }

    #[test]
    fn produces_frames_with_increasing_sequence() {
        let mut source = SyntheticSource::new(config());
        source.connect().unwrap();
        let a = source.read().unwrap().unwrap();
        let b = source.read().unwrap().unwrap();
        assert_eq!(a.width(), 32);
        assert_eq!(a.height(), 24);
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);
    }

    #[test]
    fn injected_failures_are_transient_nones() {
        let mut source = SyntheticSource::new(config()).with_failures_every(3);
        let mut ok = 0;
        let mut failed = 0;
        for _ in 0..9 {
            match source.read().unwrap() {
                Some(_) => ok += 1,
                None => failed += 1,
            }
        }
        assert_eq!(failed, 3);
        assert_eq!(ok, 6);
        assert_eq!(source.stats().read_failures, 3);
    }
}
