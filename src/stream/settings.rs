use anyhow::Result;

use crate::buffer::BufferSettings;
use crate::PipelineError;

pub const DEFAULT_RESOLUTION: (u32, u32) = (1920, 1080);
pub const DEFAULT_FPS: u32 = 60;
pub const DEFAULT_BITRATE: u64 = 25_000_000;
pub const DEFAULT_BUFFER_SECONDS: u32 = 5;
pub const DEFAULT_PRESET: &str = "ultrafast";
pub const DEFAULT_PIXEL_FORMAT: &str = "yuv420p";

const PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

/// H.264 encoder configuration for one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderSettings {
    /// Output (width, height).
    pub resolution: (u32, u32),
    pub fps: u32,
    /// Target and peak bitrate, bits per second.
    pub bitrate: u64,
    /// Keyframe interval and buffer depth, in seconds.
    pub buffer_seconds: u32,
    pub preset: String,
    pub pixel_format: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            fps: DEFAULT_FPS,
            bitrate: DEFAULT_BITRATE,
            buffer_seconds: DEFAULT_BUFFER_SECONDS,
            preset: DEFAULT_PRESET.to_string(),
            pixel_format: DEFAULT_PIXEL_FORMAT.to_string(),
        }
    }
}

impl EncoderSettings {
    pub fn validate(&self) -> Result<()> {
        let (width, height) = self.resolution;
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(PipelineError::config(format!(
                "stream resolution {}x{} must be non-zero and even",
                width, height
            )));
        }
        if self.fps == 0 {
            return Err(PipelineError::config("stream fps must be >= 1"));
        }
        if self.bitrate == 0 {
            return Err(PipelineError::config("stream bitrate must be > 0"));
        }
        if self.buffer_seconds == 0 {
            return Err(PipelineError::config("stream buffer_seconds must be >= 1"));
        }
        if !PRESETS.contains(&self.preset.as_str()) {
            return Err(PipelineError::config(format!(
                "unknown x264 preset '{}'",
                self.preset
            )));
        }
        if self.pixel_format != DEFAULT_PIXEL_FORMAT {
            return Err(PipelineError::config(format!(
                "unsupported stream pixel format '{}' (only {})",
                self.pixel_format, DEFAULT_PIXEL_FORMAT
            )));
        }
        Ok(())
    }

    /// Frames between keyframes.
    pub fn gop_size(&self) -> u32 {
        self.fps * self.buffer_seconds
    }

    /// VBV buffer, half a second of the target bitrate.
    pub fn vbv_bufsize(&self) -> u64 {
        self.bitrate / 2
    }

    /// Pacing settings matching this stream.
    pub fn buffer_settings(&self) -> BufferSettings {
        BufferSettings {
            target_fps: self.fps,
            buffer_seconds: self.buffer_seconds,
        }
    }

    /// libx264 private options: fixed GOP, no lookahead, no B-frames, CBR HRD.
    pub fn x264_params(&self) -> String {
        let gop = self.gop_size();
        let kbps = self.bitrate / 1000;
        [
            format!("fps={}/1", self.fps),
            "force-cfr=1".to_string(),
            "scenecut=0".to_string(),
            "rc-lookahead=0".to_string(),
            "sync-lookahead=0".to_string(),
            "bframes=0".to_string(),
            format!("keyint={}", gop),
            format!("min-keyint={}", gop),
            "nal-hrd=cbr".to_string(),
            format!("vbv-maxrate={}", kbps),
            format!("vbv-bufsize={}", self.vbv_bufsize() / 1000),
            "repeat-headers=1".to_string(),
            "aud=1".to_string(),
        ]
        .join(":")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gop_follows_fps_and_buffer_seconds() {
        let settings = EncoderSettings {
            fps: 30,
            buffer_seconds: 2,
            ..EncoderSettings::default()
        };
        assert_eq!(settings.gop_size(), 60);
        assert_eq!(settings.buffer_settings().capacity(), 60);
        assert_eq!(EncoderSettings::default().gop_size(), 300);
    }

    #[test]
    fn x264_params_pin_the_gop() {
        let settings = EncoderSettings {
            fps: 25,
            buffer_seconds: 2,
            bitrate: 4_000_000,
            ..EncoderSettings::default()
        };
        let params = settings.x264_params();
        assert!(params.contains("keyint=50:min-keyint=50"));
        assert!(params.contains("scenecut=0"));
        assert!(params.contains("bframes=0"));
        assert!(params.contains("vbv-maxrate=4000:vbv-bufsize=2000"));
    }

    #[test]
    fn validation_rejects_odd_sizes_and_unknown_presets() {
        let odd = EncoderSettings {
            resolution: (1921, 1080),
            ..EncoderSettings::default()
        };
        assert!(odd.validate().is_err());
        let preset = EncoderSettings {
            preset: "ludicrous".into(),
            ..EncoderSettings::default()
        };
        assert!(preset.validate().is_err());
        assert!(EncoderSettings::default().validate().is_ok());
    }
}
