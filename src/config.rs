use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::buffer::BufferSettings;
use crate::camera::profile::{CameraProfile, Device, Lens, RigGeometry};
use crate::camera::DEFAULT_CAPTURE_TIMEOUT;
use crate::pipeline::{FusionSettings, DEFAULT_MAX_CONSECUTIVE_TIMEOUTS};
use crate::stream::EncoderSettings;
use crate::tracking::{
    MotionService, SideDecisionService, SideWeights, ZoomService, ZoomWeights, DEFAULT_MAX_ACC,
    DEFAULT_MAX_SPEED, DEFAULT_NEAR_BALL_RADIUS, DEFAULT_SMOOTHING,
};
use crate::PipelineError;

const DEFAULT_DEVICE: &str = "synthetic";
const DEFAULT_STREAM_URL: &str = "null://";
const DEFAULT_LEFT_INDEX: usize = 0;
const DEFAULT_RIGHT_INDEX: usize = 1;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RigConfigFile {
    camera: Option<CameraConfigFile>,
    rig: Option<RigConfigSection>,
    stream: Option<StreamConfigFile>,
    tracking: Option<TrackingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    device: Option<String>,
    mode: Option<String>,
    left_index: Option<usize>,
    right_index: Option<usize>,
    capture_timeout_ms: Option<u64>,
    max_consecutive_timeouts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RigConfigSection {
    fov_deg: Option<f64>,
    overlap_angle_deg: Option<f64>,
    baseline_cm: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    bitrate: Option<u64>,
    buffer_seconds: Option<u32>,
    preset: Option<String>,
    pixel_format: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrackingConfigFile {
    max_speed: Option<f64>,
    max_acc: Option<f64>,
    /// [velocity, acceleration, distance]
    side_weights: Option<[f64; 3]>,
    /// [speed, acceleration, players]
    zoom_weights: Option<[f64; 3]>,
    near_ball_radius: Option<f64>,
    smoothing: Option<f64>,
    denoise_sigma: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct RigConfig {
    pub camera: CameraSettings,
    pub lens: Lens,
    pub geometry: RigGeometry,
    pub stream: StreamSettings,
    pub tracking: TrackingSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: Device,
    pub mode: Option<String>,
    pub left_index: usize,
    pub right_index: usize,
    pub capture_timeout: Duration,
    pub max_consecutive_timeouts: u32,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub encoder: EncoderSettings,
}

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub max_speed: f64,
    pub max_acc: f64,
    pub side_weights: SideWeights,
    pub zoom_weights: ZoomWeights,
    pub near_ball_radius: f64,
    pub smoothing: f64,
    pub denoise_sigma: f32,
}

impl RigConfig {
    /// Defaults, then the file named by `DUALCAM_CONFIG`, then `DUALCAM_*`
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DUALCAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, reading `path` instead of `DUALCAM_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        log::info!(
            "config: device={} mode={} stream={} {}x{}@{} bitrate={} buffer={}s",
            cfg.camera.device.name(),
            cfg.camera.mode.as_deref().unwrap_or("default"),
            cfg.stream.url,
            cfg.stream.encoder.resolution.0,
            cfg.stream.encoder.resolution.1,
            cfg.stream.encoder.fps,
            cfg.stream.encoder.bitrate,
            cfg.stream.encoder.buffer_seconds
        );
        Ok(cfg)
    }

    fn from_file(file: RigConfigFile) -> Result<Self> {
        let camera_file = file.camera.unwrap_or_default();
        let rig_file = file.rig.unwrap_or_default();
        let stream_file = file.stream.unwrap_or_default();
        let tracking_file = file.tracking.unwrap_or_default();

        let device_name = camera_file
            .device
            .unwrap_or_else(|| DEFAULT_DEVICE.to_string());
        let camera = CameraSettings {
            device: Device::from_name(&device_name)?,
            mode: camera_file.mode,
            left_index: camera_file.left_index.unwrap_or(DEFAULT_LEFT_INDEX),
            right_index: camera_file.right_index.unwrap_or(DEFAULT_RIGHT_INDEX),
            capture_timeout: camera_file
                .capture_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CAPTURE_TIMEOUT),
            max_consecutive_timeouts: camera_file
                .max_consecutive_timeouts
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_TIMEOUTS),
        };

        let lens = match rig_file.fov_deg {
            Some(fov) => Lens::new(fov)?,
            None => Lens::default(),
        };
        let defaults = RigGeometry::default();
        let geometry = RigGeometry {
            overlap_angle_deg: rig_file
                .overlap_angle_deg
                .unwrap_or(defaults.overlap_angle_deg),
            baseline_cm: rig_file.baseline_cm.unwrap_or(defaults.baseline_cm),
        };

        let encoder_defaults = EncoderSettings::default();
        let stream = StreamSettings {
            url: stream_file
                .url
                .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
            encoder: EncoderSettings {
                resolution: (
                    stream_file.width.unwrap_or(encoder_defaults.resolution.0),
                    stream_file.height.unwrap_or(encoder_defaults.resolution.1),
                ),
                fps: stream_file.fps.unwrap_or(encoder_defaults.fps),
                bitrate: stream_file.bitrate.unwrap_or(encoder_defaults.bitrate),
                buffer_seconds: stream_file
                    .buffer_seconds
                    .unwrap_or(encoder_defaults.buffer_seconds),
                preset: stream_file.preset.unwrap_or(encoder_defaults.preset),
                pixel_format: stream_file
                    .pixel_format
                    .unwrap_or(encoder_defaults.pixel_format),
            },
        };

        let tracking = TrackingSettings {
            max_speed: tracking_file.max_speed.unwrap_or(DEFAULT_MAX_SPEED),
            max_acc: tracking_file.max_acc.unwrap_or(DEFAULT_MAX_ACC),
            side_weights: tracking_file
                .side_weights
                .map(|[velocity, acceleration, distance]| SideWeights {
                    velocity,
                    acceleration,
                    distance,
                })
                .unwrap_or_default(),
            zoom_weights: tracking_file
                .zoom_weights
                .map(|[speed, acceleration, players]| ZoomWeights {
                    speed,
                    acceleration,
                    players,
                })
                .unwrap_or_default(),
            near_ball_radius: tracking_file
                .near_ball_radius
                .unwrap_or(DEFAULT_NEAR_BALL_RADIUS),
            smoothing: tracking_file.smoothing.unwrap_or(DEFAULT_SMOOTHING),
            denoise_sigma: tracking_file.denoise_sigma.unwrap_or(0.0),
        };

        Ok(Self {
            camera,
            lens,
            geometry,
            stream,
            tracking,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("DUALCAM_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = Device::from_name(&device)?;
            }
        }
        if let Ok(url) = std::env::var("DUALCAM_STREAM_URL") {
            if !url.trim().is_empty() {
                self.stream.url = url.trim().to_string();
            }
        }
        if let Some(fps) = env_number::<u32>("DUALCAM_STREAM_FPS")? {
            self.stream.encoder.fps = fps;
        }
        if let Some(bitrate) = env_number::<u64>("DUALCAM_BITRATE")? {
            self.stream.encoder.bitrate = bitrate;
        }
        if let Some(seconds) = env_number::<u32>("DUALCAM_BUFFER_SECONDS")? {
            self.stream.encoder.buffer_seconds = seconds;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.stream.encoder.validate()?;
        crate::stream::StreamProtocol::from_url(&self.stream.url)?;
        if self.camera.left_index == self.camera.right_index {
            return Err(PipelineError::config(format!(
                "left and right cameras both use index {}",
                self.camera.left_index
            )));
        }
        if self.camera.capture_timeout.is_zero() {
            return Err(PipelineError::config("capture timeout must be greater than zero"));
        }
        if self.tracking.denoise_sigma < 0.0 {
            return Err(PipelineError::config("denoise sigma must not be negative"));
        }
        if let Some(mode) = &self.camera.mode {
            self.camera.device.sensor().mode(mode)?;
        }
        self.geometry.validate(&self.lens)?;
        // Builds (and so validates) every tracking service.
        self.fusion_settings()?;
        Ok(())
    }

    pub fn camera_profile(&self) -> Result<CameraProfile> {
        CameraProfile::resolve(self.camera.device, self.camera.mode.as_deref(), Some(self.lens))
    }

    pub fn buffer_settings(&self) -> BufferSettings {
        self.stream.encoder.buffer_settings()
    }

    pub fn fusion_settings(&self) -> Result<FusionSettings> {
        let profile = self.camera_profile()?;
        let frame_width = profile.mode.width;
        let overlap = self.geometry.overlap_px(frame_width, &self.lens)?;
        let tracking = &self.tracking;
        let as_config = |err: anyhow::Error| PipelineError::config(format!("{:#}", err));

        let side = SideDecisionService::new(frame_width, overlap)
            .and_then(|s| s.with_limits(tracking.max_speed, tracking.max_acc))
            .and_then(|s| s.with_weights(tracking.side_weights))
            .map_err(as_config)?;
        let zoom = ZoomService::new(
            tracking.near_ball_radius,
            tracking.max_speed,
            tracking.max_acc,
            tracking.zoom_weights,
            tracking.smoothing,
        )
        .map_err(as_config)?;

        Ok(FusionSettings {
            output: self.stream.encoder.resolution,
            denoise_sigma: tracking.denoise_sigma,
            max_consecutive_timeouts: self.camera.max_consecutive_timeouts,
            motion: MotionService::new(profile.mode.fps).map_err(as_config)?,
            side,
            zoom,
        })
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PipelineError::config(format!("{} must be a non-negative integer", name))),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<RigConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
    let parsed = if is_json {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    } else {
        toml::from_str(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| PipelineError::config(format!("invalid config file {}: {}", path.display(), e)))
}
