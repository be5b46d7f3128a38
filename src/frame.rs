//! Frame container and per-frame geometry.
//!
//! - `Frame`: packed pixel buffer plus a monotonic capture timestamp.
//! - `PixelFormat`: the packed 24-bit layouts the cameras deliver.
//! - `CropWindow` / `transform`: the zoom crop applied to the selected camera.
//!
//! Pixel storage is reference counted. Cloning a `Frame` is cheap and shares
//! the buffer, which is what the buffer engine relies on for frame hold: a
//! held frame is the *same* buffer re-emitted, not a copy.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::tracking::ZoomData;

/// Smallest crop window, in pixels, regardless of zoom level.
pub const MIN_CROP_WIDTH: u32 = 16;
pub const MIN_CROP_HEIGHT: u32 = 9;

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds on the process-wide monotonic clock.
///
/// Both cameras stamp frames with this clock, so timestamps from the left and
/// right camera are directly comparable.
pub fn monotonic_seconds() -> f64 {
    CLOCK_EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

// ----------------------------------------------------------------------------
// PixelFormat
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Bgr24,
    Rgb24,
}

impl PixelFormat {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "bgr24" | "bgr888" | "bgr" => Ok(Self::Bgr24),
            "rgb24" | "rgb888" | "rgb" => Ok(Self::Rgb24),
            other => Err(anyhow!("unsupported capture pixel format '{}'", other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Bgr24 => "bgr24",
            Self::Rgb24 => "rgb24",
        }
    }

    pub fn channels(self) -> usize {
        3
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured (or fused) picture.
///
/// The buffer shape is fixed by `width`, `height` and `format`; `new` rejects
/// buffers whose length does not match.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Monotonic capture time in seconds (see `monotonic_seconds`).
    pub timestamp: f64,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp: f64,
    ) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * format.channels();
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} {}",
                data.len(),
                expected,
                width,
                height,
                format.name()
            ));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            format,
            timestamp,
        })
    }

    /// Solid-colour frame, used by synthetic cameras and tests.
    pub fn solid(
        width: u32,
        height: u32,
        format: PixelFormat,
        color: [u8; 3],
        timestamp: f64,
    ) -> Self {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&color);
        }
        Self {
            data: data.into(),
            width,
            height,
            format,
            timestamp,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Row length in bytes.
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.channels()
    }

    /// True when both frames share one pixel buffer.
    pub fn same_buffer(a: &Frame, b: &Frame) -> bool {
        Arc::ptr_eq(&a.data, &b.data)
    }

    /// Same pixels, new timestamp.
    pub fn with_timestamp(&self, timestamp: f64) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    fn view(&self) -> Result<ImageBuffer<Rgb<u8>, &[u8]>> {
        ImageBuffer::from_raw(self.width, self.height, self.data())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }

    fn from_image(
        image: ImageBuffer<Rgb<u8>, Vec<u8>>,
        format: PixelFormat,
        timestamp: f64,
    ) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw().into(),
            width,
            height,
            format,
            timestamp,
        }
    }

    /// Gaussian denoise. Channel order is irrelevant to the filter, so packed
    /// BGR is treated as RGB.
    pub fn denoise(&self, sigma: f32) -> Result<Self> {
        if sigma <= 0.0 {
            return Ok(self.clone());
        }
        let blurred = imageops::blur(&self.view()?, sigma);
        Ok(Self::from_image(blurred, self.format, self.timestamp))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("timestamp", &self.timestamp)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Crop / transform
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropWindow {
    /// Crop window for a zoom level, centred on the zoom centre and clamped
    /// inside the frame.
    ///
    /// The window is `frame * (1 - zoom_level)`, never smaller than
    /// `MIN_CROP_WIDTH` x `MIN_CROP_HEIGHT` and never larger than the frame.
    pub fn for_zoom(frame_width: u32, frame_height: u32, zoom: &ZoomData) -> Self {
        let level = zoom.zoom_level.clamp(0.0, 1.0);
        let width = ((frame_width as f64 * (1.0 - level)) as u32)
            .max(MIN_CROP_WIDTH)
            .min(frame_width);
        let height = ((frame_height as f64 * (1.0 - level)) as u32)
            .max(MIN_CROP_HEIGHT)
            .min(frame_height);

        let left = (zoom.center.x - width as f64 / 2.0) as i64;
        let top = (zoom.center.y - height as f64 / 2.0) as i64;
        let x = left.clamp(0, (frame_width - width) as i64) as u32;
        let y = top.clamp(0, (frame_height - height) as i64) as u32;

        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(frame_width: u32, frame_height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width: frame_width,
            height: frame_height,
        }
    }
}

/// Copy the rows of `window` out of `frame` into an owned buffer.
fn crop_rows(frame: &Frame, window: CropWindow) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>> {
    let channels = frame.format.channels();
    let row_bytes = window.width as usize * channels;
    let stride = frame.stride();
    let mut pixels = Vec::with_capacity(row_bytes * window.height as usize);
    for row in window.y..window.y + window.height {
        let start = row as usize * stride + window.x as usize * channels;
        let line = frame
            .data()
            .get(start..start + row_bytes)
            .ok_or_else(|| anyhow!("crop row {} is out of bounds", row))?;
        pixels.extend_from_slice(line);
    }
    ImageBuffer::from_raw(window.width, window.height, pixels)
        .ok_or_else(|| anyhow!("cropped buffer does not match {:?}", window))
}

/// Crop `frame` to `window` and resize the result to `output` (width, height).
pub fn transform(frame: &Frame, window: CropWindow, output: (u32, u32)) -> Result<Frame> {
    if window.x + window.width > frame.width || window.y + window.height > frame.height {
        return Err(anyhow!(
            "crop window {:?} exceeds {}x{} frame",
            window,
            frame.width,
            frame.height
        ));
    }
    let (out_width, out_height) = output;
    let cropped = crop_rows(frame, window)?;
    let resized = if (window.width, window.height) == output {
        cropped
    } else {
        imageops::resize(&cropped, out_width, out_height, FilterType::Triangle)
    };
    Ok(Frame::from_image(resized, frame.format, frame.timestamp))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
