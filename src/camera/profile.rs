//! Device, sensor and lens profiles.
//!
//! Resolved once at startup into closed enums; nothing downstream matches on
//! strings.

use anyhow::Result;
use std::path::Path;

use crate::frame::PixelFormat;
use crate::PipelineError;

/// Device-tree model file consulted by `Device::detect`.
pub const DEVICE_MODEL_PATH: &str = "/sys/firmware/devicetree/base/model";

pub const DEFAULT_FOV_DEG: f64 = 120.0;
pub const DEFAULT_OVERLAP_ANGLE_DEG: f64 = 60.0;
pub const DEFAULT_BASELINE_CM: f64 = 75.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Jetson,
    RaspberryPi,
    Synthetic,
}

impl Device {
    /// Parse a configured device name. `auto` probes the device tree.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "jetson" => Ok(Self::Jetson),
            "raspberrypi" | "raspberry_pi" | "rpi" => Ok(Self::RaspberryPi),
            "synthetic" | "stub" => Ok(Self::Synthetic),
            "auto" => Self::detect(),
            other => Err(PipelineError::config(format!("unsupported device '{}'", other))),
        }
    }

    /// Map a device-tree model string to a device.
    pub fn from_model(model: &str) -> Result<Self> {
        let model = model.trim_end_matches('\0').to_ascii_lowercase();
        if model.contains("jetson") {
            Ok(Self::Jetson)
        } else if model.contains("raspberry") {
            Ok(Self::RaspberryPi)
        } else {
            Err(PipelineError::config(format!(
                "unsupported device model '{}'",
                model.trim()
            )))
        }
    }

    pub fn detect() -> Result<Self> {
        Self::detect_from(Path::new(DEVICE_MODEL_PATH))
    }

    pub fn detect_from(path: &Path) -> Result<Self> {
        let model = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read device model {}: {}", path.display(), e))
        })?;
        let device = Self::from_model(&model)?;
        log::info!("detected device {:?} from {}", device, path.display());
        Ok(device)
    }

    pub fn sensor(self) -> Sensor {
        match self {
            Self::Jetson => Sensor::Imx477,
            Self::RaspberryPi => Sensor::Imx708,
            Self::Synthetic => Sensor::Synthetic,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Jetson => "jetson",
            Self::RaspberryPi => "raspberrypi",
            Self::Synthetic => "synthetic",
        }
    }
}

/// One named sensor readout mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureMode {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub hdr: bool,
}

const fn mode(name: &'static str, width: u32, height: u32, fps: u32, hdr: bool) -> CaptureMode {
    CaptureMode {
        name,
        width,
        height,
        fps,
        hdr,
    }
}

const IMX708_MODES: &[CaptureMode] = &[
    mode("2304x1296_56", 2304, 1296, 56, false),
    mode("2304x1296_30", 2304, 1296, 30, false),
    mode("1536x864_120", 1536, 864, 120, true),
];

const IMX477_MODES: &[CaptureMode] = &[
    mode("1920x1080_60", 1920, 1080, 60, false),
    mode("2304x1296_30", 2304, 1296, 30, false),
    mode("3840x2160_30", 3840, 2160, 30, false),
];

const SYNTHETIC_MODES: &[CaptureMode] = &[
    mode("640x360_30", 640, 360, 30, false),
    mode("1280x720_30", 1280, 720, 30, false),
    mode("1920x1080_30", 1920, 1080, 30, false),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sensor {
    Imx477,
    Imx708,
    Synthetic,
}

impl Sensor {
    pub fn name(self) -> &'static str {
        match self {
            Self::Imx477 => "imx477",
            Self::Imx708 => "imx708",
            Self::Synthetic => "synthetic",
        }
    }

    pub fn modes(self) -> &'static [CaptureMode] {
        match self {
            Self::Imx477 => IMX477_MODES,
            Self::Imx708 => IMX708_MODES,
            Self::Synthetic => SYNTHETIC_MODES,
        }
    }

    pub fn default_mode(self) -> CaptureMode {
        self.modes()[0]
    }

    pub fn mode(self, name: &str) -> Result<CaptureMode> {
        self.modes()
            .iter()
            .copied()
            .find(|m| m.name.eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "sensor {} has no capture mode '{}' (available: {})",
                    self.name(),
                    name,
                    self.modes().iter().map(|m| m.name).collect::<Vec<_>>().join(", ")
                ))
            })
    }

    /// Layout of the frames handed to the pipeline. Capture pipelines convert
    /// to this format before the appsink.
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            Self::Imx708 => PixelFormat::Rgb24,
            Self::Imx477 | Self::Synthetic => PixelFormat::Bgr24,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Lens {
    pub fov_deg: f64,
}

impl Default for Lens {
    fn default() -> Self {
        Self {
            fov_deg: DEFAULT_FOV_DEG,
        }
    }
}

impl Lens {
    pub fn new(fov_deg: f64) -> Result<Self> {
        if !(fov_deg > 0.0 && fov_deg < 180.0) {
            return Err(PipelineError::config(format!(
                "lens field of view must be within (0, 180) degrees (got {})",
                fov_deg
            )));
        }
        Ok(Self { fov_deg })
    }
}

/// Everything the pipeline needs to know about one camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraProfile {
    pub device: Device,
    pub sensor: Sensor,
    pub mode: CaptureMode,
    pub lens: Lens,
    pub format: PixelFormat,
}

impl CameraProfile {
    pub fn resolve(device: Device, mode_name: Option<&str>, lens: Option<Lens>) -> Result<Self> {
        let sensor = device.sensor();
        let mode = match mode_name {
            Some(name) => sensor.mode(name)?,
            None => sensor.default_mode(),
        };
        let profile = Self {
            device,
            sensor,
            mode,
            lens: lens.unwrap_or_default(),
            format: sensor.pixel_format(),
        };
        log::debug!(
            "camera profile: device={} sensor={} mode={} fov={}",
            device.name(),
            sensor.name(),
            mode.name,
            profile.lens.fov_deg
        );
        Ok(profile)
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.mode.width, self.mode.height)
    }
}

/// Physical arrangement of the two cameras.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RigGeometry {
    /// Angle of the wedge both cameras see.
    pub overlap_angle_deg: f64,
    /// Distance from the cameras to the near edge of the shared region.
    pub baseline_cm: f64,
}

impl Default for RigGeometry {
    fn default() -> Self {
        Self {
            overlap_angle_deg: DEFAULT_OVERLAP_ANGLE_DEG,
            baseline_cm: DEFAULT_BASELINE_CM,
        }
    }
}

impl RigGeometry {
    pub fn validate(&self, lens: &Lens) -> Result<()> {
        if !(self.overlap_angle_deg >= 0.0 && self.overlap_angle_deg <= lens.fov_deg) {
            return Err(PipelineError::config(format!(
                "overlap angle {} must be within 0..={} (lens fov)",
                self.overlap_angle_deg, lens.fov_deg
            )));
        }
        if self.baseline_cm <= 0.0 {
            return Err(PipelineError::config("rig baseline must be positive"));
        }
        Ok(())
    }

    /// Width in pixels of the band visible to both cameras.
    pub fn overlap_px(&self, frame_width: u32, lens: &Lens) -> Result<u32> {
        self.validate(lens)?;
        let half_overlap = (self.overlap_angle_deg / 2.0).to_radians().tan();
        let half_fov = (lens.fov_deg / 2.0).to_radians().tan();
        // Epsilon keeps exact ratios (1/3 at the defaults) from flooring one short.
        let px = (frame_width as f64 * half_overlap / half_fov + 1e-9).floor();
        Ok((px as u32).min(frame_width))
    }
}
