use anyhow::{anyhow, Result};
use rand::Rng;
use std::time::{Duration, Instant};

use super::FrameGrabber;
use crate::frame::{monotonic_seconds, Frame, PixelFormat};

/// Settings for the synthetic camera.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    /// Random deviation of each capture interval, as a fraction of it.
    pub jitter: f64,
    /// Every `stall_every` frames the camera freezes for `stall`. 0 disables.
    pub stall_every: u64,
    pub stall: Duration,
    /// Stop producing after this many frames; later grabs fail.
    pub frame_limit: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            fps: 30,
            format: PixelFormat::Bgr24,
            jitter: 0.0,
            stall_every: 0,
            stall: Duration::ZERO,
            frame_limit: None,
        }
    }
}

/// Generates a moving test pattern at a nominal frame rate.
///
/// Used for `synthetic` devices and in tests. Jitter and stalls simulate the
/// irregular delivery of real sensors.
pub struct SyntheticGrabber {
    config: SyntheticConfig,
    frame_count: u64,
    next_due: Option<Instant>,
    last_timestamp: f64,
}

impl SyntheticGrabber {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            next_due: None,
            last_timestamp: f64::NEG_INFINITY,
        }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    fn interval(&self) -> Duration {
        let nominal = 1.0 / self.config.fps.max(1) as f64;
        let jitter = self.config.jitter.clamp(0.0, 0.9);
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(nominal * factor)
    }

    fn pixels(&self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let channels = self.config.format.channels();
        let mut pixels = vec![0u8; width * height * channels];
        // A vertical bar sweeps across a gradient background.
        let bar = (self.frame_count as usize * 4) % width.max(1);
        for (row, line) in pixels.chunks_exact_mut(width * channels).enumerate() {
            for (col, px) in line.chunks_exact_mut(channels).enumerate() {
                if col.abs_diff(bar) < 3 {
                    px.fill(255);
                } else {
                    px[0] = (col * 255 / width.max(1)) as u8;
                    px[1] = (row * 255 / height.max(1)) as u8;
                    px[2] = (self.frame_count % 256) as u8;
                }
            }
        }
        pixels
    }
}

impl FrameGrabber for SyntheticGrabber {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(&mut self) -> Result<()> {
        if self.config.width == 0 || self.config.height == 0 || self.config.fps == 0 {
            return Err(anyhow!(
                "synthetic camera needs non-zero size and fps ({}x{} @ {})",
                self.config.width,
                self.config.height,
                self.config.fps
            ));
        }
        self.next_due = Some(Instant::now() + self.interval());
        Ok(())
    }

    fn grab(&mut self) -> Result<Frame> {
        if let Some(limit) = self.config.frame_limit {
            if self.frame_count >= limit {
                std::thread::sleep(self.interval());
                return Err(anyhow!("synthetic camera exhausted after {} frames", limit));
            }
        }

        let due = self.next_due.unwrap_or_else(Instant::now);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
        self.frame_count += 1;
        if self.config.stall_every > 0 && self.frame_count % self.config.stall_every == 0 {
            log::debug!("synthetic camera stalling for {:?}", self.config.stall);
            std::thread::sleep(self.config.stall);
        }
        self.next_due = Some(Instant::now() + self.interval());

        let mut timestamp = monotonic_seconds();
        if timestamp <= self.last_timestamp {
            timestamp = self.last_timestamp + 1e-6;
        }
        self.last_timestamp = timestamp;

        Frame::new(
            self.pixels(),
            self.config.width,
            self.config.height,
            self.config.format,
            timestamp,
        )
    }
}
