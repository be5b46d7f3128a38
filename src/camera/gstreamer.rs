//! GStreamer capture for CSI sensors.
//!
//! Builds a `nvarguscamerasrc` (Jetson) or `libcamerasrc` (Raspberry Pi)
//! pipeline ending in an appsink that keeps a single buffer and drops older
//! ones, so a slow reader never sees stale frames.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::profile::{CameraProfile, Device};
use super::FrameGrabber;
use crate::frame::{monotonic_seconds, Frame, PixelFormat};
use crate::PipelineError;

/// gst-launch description for one camera of the rig.
pub fn pipeline_description(profile: &CameraProfile, sensor_index: usize) -> Result<String> {
    let mode = profile.mode;
    let format = match profile.format {
        PixelFormat::Bgr24 => "BGR",
        PixelFormat::Rgb24 => "RGB",
    };
    let source = match profile.device {
        Device::Jetson => format!(
            "nvarguscamerasrc sensor-id={} ! \
             video/x-raw(memory:NVMM),width={},height={},framerate={}/1 ! \
             nvvidconv ! video/x-raw,format=BGRx ! videoconvert",
            sensor_index, mode.width, mode.height, mode.fps
        ),
        Device::RaspberryPi => format!(
            "libcamerasrc camera-name=/base/soc/i2c0mux/i2c@{}/imx708@1a ! \
             video/x-raw,width={},height={},framerate={}/1 ! videoconvert",
            sensor_index, mode.width, mode.height, mode.fps
        ),
        Device::Synthetic => {
            return Err(PipelineError::config(
                "synthetic device has no gstreamer capture pipeline",
            ))
        }
    };
    Ok(format!(
        "{} ! video/x-raw,format={} ! appsink name=appsink sync=false max-buffers=1 drop=true",
        source, format
    ))
}

pub struct GstreamerGrabber {
    description: String,
    format: PixelFormat,
    fps: u32,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
    last_error: Option<String>,
}

impl GstreamerGrabber {
    pub fn new(profile: &CameraProfile, sensor_index: usize) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            description: pipeline_description(profile, sensor_index)?,
            format: profile.format,
            fps: profile.mode.fps,
            pipeline: None,
            appsink: None,
            last_error: None,
        })
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.fps == 0 {
            500
        } else {
            (1000 / self.fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

impl FrameGrabber for GstreamerGrabber {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn open(&mut self) -> Result<()> {
        let pipeline = gstreamer::parse::launch(&self.description)
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline is not a Pipeline"))?;
        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set capture pipeline to Playing")?;
        log::info!("gstreamer capture: {}", self.description);
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.last_error = None;
        Ok(())
    }

    fn grab(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            return Err(anyhow!(err));
        }
        let timeout = self.frame_timeout();
        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| anyhow!("capture pipeline is not open"))?;
        let sample = appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| anyhow!("capture pipeline stalled for {:?}", timeout))?;
        let timestamp = monotonic_seconds();
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Frame::new(pixels, width, height, self.format, timestamp)
    }

    fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("gstreamer capture: failed to stop pipeline: {}", err);
            }
        }
        self.appsink = None;
    }
}

impl Drop for GstreamerGrabber {
    fn drop(&mut self) {
        self.close();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map capture buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("capture buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jetson_pipeline_targets_sensor_and_bgr() -> Result<()> {
        let profile = CameraProfile::resolve(Device::Jetson, Some("1920x1080_60"), None)?;
        let description = pipeline_description(&profile, 1)?;
        assert!(description.starts_with("nvarguscamerasrc sensor-id=1"));
        assert!(description.contains("framerate=60/1"));
        assert!(description.contains("format=BGR ! appsink"));
        assert!(description.contains("max-buffers=1 drop=true"));
        Ok(())
    }

    #[test]
    fn synthetic_device_has_no_pipeline() -> Result<()> {
        let profile = CameraProfile::resolve(Device::Synthetic, None, None)?;
        assert!(pipeline_description(&profile, 0).is_err());
        Ok(())
    }
}
