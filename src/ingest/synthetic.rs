//! Synthetic source for `stub://` URLs.
//!
//! Produces a slowly shifting gradient at the configured rate. Used by tests
//! and for running the whole gateway without a camera.

use std::time::Instant;

use anyhow::{anyhow, Result};

use super::{frame_interval, CapturedImage, FrameSource, SourceConfig};

pub struct SyntheticSource {
    config: SourceConfig,
    connected: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    /// Simulated scene state; bumps every 50 frames.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            connected: false,
            frame_count: 0,
            last_frame_at: None,
            scene_state: 0,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = self.config.width as usize * self.config.height as usize * 3;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CapturedImage> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected"));
        }
        // Pace like a real camera so consumers see a realistic rate.
        let interval = frame_interval(self.config.target_fps);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(CapturedImage {
            pixels: self.generate_pixels(),
            width: self.config.width,
            height: self.config.height,
        })
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.url)
    }
}
