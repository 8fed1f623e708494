#![cfg(feature = "ingest-v4l2")]

//! V4L2 camera source for local `/dev/video*` devices.
//!
//! The device is asked for packed RGB; drivers that only speak YUYV get
//! converted on the way in. A failed capture is reported as a transient
//! `Ok(None)` so the capture stage can skip and retry; only failure to open
//! the device at all is a hard error.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::{CameraConfig, CameraSource, SourceStats};
use crate::frame::Frame;

pub struct V4l2Source {
    config: CameraConfig,
    device_path: String,
    state: Option<V4l2State>,
    active_width: u32,
    active_height: u32,
    fourcc: [u8; 4],
    frame_count: u64,
    read_failures: u64,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: CameraConfig) -> Result<Self> {
        let device_path = config
            .url
            .strip_prefix("v4l2://")
            .unwrap_or(&config.url)
            .to_string();
        Ok(Self {
            active_width: config.width,
            active_height: config.height,
            fourcc: *b"RGB3",
            config,
            device_path,
            state: None,
            frame_count: 0,
            read_failures: 0,
        })
    }

    fn convert(&self, buf: &[u8]) -> Result<Vec<u8>> {
        match &self.fourcc {
            b"RGB3" => {
                let expected = (self.active_width * self.active_height * 3) as usize;
                if buf.len() < expected {
                    return Err(anyhow!(
                        "short RGB capture: expected {}, got {}",
                        expected,
                        buf.len()
                    ));
                }
                Ok(buf[..expected].to_vec())
            }
            b"YUYV" => yuyv_to_rgb(buf, self.active_width, self.active_height),
            other => Err(anyhow!(
                "unsupported pixel format {:?} from {}",
                String::from_utf8_lossy(other),
                self.device_path
            )),
        }
    }
}

impl CameraSource for V4l2Source {
    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.device_path)
            .with_context(|| format!("open v4l2 device {}", self.device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("camera: failed to set format on {}: {}", self.device_path, err);
                device.format().context("read v4l2 format after set failure")?
            }
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("camera: failed to set fps on {}: {}", self.device_path, err);
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.fourcc = format.fourcc.repr;

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "camera: connected to {} ({}x{} {})",
            self.device_path,
            self.active_width,
            self.active_height,
            String::from_utf8_lossy(&self.fourcc)
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let Some(state) = self.state.as_mut() else {
            return Err(anyhow!("v4l2 device {} not connected", self.device_path));
        };

        let captured = state.with_stream_mut(|stream| stream.next().map(|(buf, _meta)| buf.to_vec()));
        let buf = match captured {
            Ok(buf) => buf,
            Err(err) => {
                log::warn!("camera: capture failed on {}: {}", self.device_path, err);
                self.read_failures += 1;
                return Ok(None);
            }
        };

        let pixels = match self.convert(&buf) {
            Ok(pixels) => pixels,
            Err(err) => {
                log::warn!("camera: {}", err);
                self.read_failures += 1;
                return Ok(None);
            }
        };

        let frame = Frame::from_rgb(pixels, self.active_width, self.active_height, self.frame_count)?;
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

/// Packed YUYV 4:2:2 to RGB24 (BT.601).
fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixel_count = (width * height) as usize;
    if buf.len() < pixel_count * 2 {
        return Err(anyhow!(
            "short YUYV capture: expected {}, got {}",
            pixel_count * 2,
            buf.len()
        ));
    }

    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for chunk in buf[..pixel_count * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (
            chunk[0] as f32,
            chunk[1] as f32 - 128.0,
            chunk[2] as f32,
            chunk[3] as f32 - 128.0,
        );
        for y in [y0, y1] {
            rgb.push(clamp_u8(y + 1.402 * v));
            rgb.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_u8(y + 1.772 * u));
        }
    }
    Ok(rgb)
}

fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_gray_converts_to_gray() -> Result<()> {
        // Two pixels: Y=128, U=V=128 (neutral chroma) -> mid gray.
        let yuyv = vec![128u8, 128, 128, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1)?;
        assert_eq!(rgb, vec![128u8; 6]);
        Ok(())
    }

    #[test]
    fn short_yuyv_buffer_is_rejected() {
        assert!(yuyv_to_rgb(&[0u8; 4], 4, 4).is_err());
    }
}
