//! Stream service and command dispatch.
//!
//! `StreamService` ties the pieces together: it owns the `VideoService`
//! (both cameras plus fusion) and one `StreamSession`. Streaming wires
//! `VideoService::frames()` through a fresh `BufferEngine` into the session.

use anyhow::{anyhow, Result};
use std::str::FromStr;
use std::sync::Arc;

use crate::buffer::BufferEngine;
use crate::camera::{open_camera, Camera};
use crate::config::RigConfig;
use crate::pipeline::{DetectorFactory, VideoService};
use crate::stream::{EncoderSettings, SessionReport, StreamSession};
use crate::tracking::Side;

/// Controller commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamCommand {
    Start,
    Stop,
    Restart,
    Status,
    Focus,
    /// Stream to `url`, or to the configured URL when `None`.
    Stream { url: Option<String> },
}

impl FromStr for StreamCommand {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        let mut parts = input.split_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| anyhow!("empty command"))?
            .to_ascii_lowercase();
        let command = match verb.as_str() {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "restart" => Self::Restart,
            "status" => Self::Status,
            "focus" => Self::Focus,
            "stream" => Self::Stream {
                url: parts.next().map(str::to_string),
            },
            other => return Err(anyhow!("unknown command '{}'", other)),
        };
        if parts.next().is_some() {
            return Err(anyhow!("too many arguments for '{}'", verb));
        }
        Ok(command)
    }
}

/// Snapshot returned by every command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceStatus {
    pub active: bool,
    pub streaming: bool,
    pub left_camera: bool,
    pub right_camera: bool,
    pub last_session: Option<SessionReport>,
}

pub struct StreamService {
    video: VideoService,
    encoder: EncoderSettings,
    default_url: String,
    session: StreamSession,
    active: bool,
}

impl StreamService {
    pub fn new(video: VideoService, encoder: EncoderSettings, default_url: &str) -> Result<Self> {
        let session = StreamSession::new(encoder.clone())?;
        Ok(Self {
            video,
            encoder,
            default_url: default_url.to_string(),
            session,
            active: false,
        })
    }

    /// Cameras, fusion and stream settings from `config`.
    pub fn from_config(config: &RigConfig, detector: DetectorFactory) -> Result<Self> {
        let profile = config.camera_profile()?;
        let timeout = config.camera.capture_timeout;
        let left: Arc<dyn Camera> = Arc::new(open_camera(profile, config.camera.left_index, timeout)?);
        let right: Arc<dyn Camera> =
            Arc::new(open_camera(profile, config.camera.right_index, timeout)?);
        let video = VideoService::new(left, right, config.fusion_settings()?, detector);
        Self::new(video, config.stream.encoder.clone(), &config.stream.url)
    }

    pub fn video(&self) -> &VideoService {
        &self.video
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Start both cameras. No-op when already active.
    pub fn start(&mut self) -> Result<()> {
        if self.active {
            log::debug!("stream service already active");
            return Ok(());
        }
        self.video.start()?;
        self.active = true;
        log::info!("stream service started");
        Ok(())
    }

    /// End the stream session, then the cameras. Idempotent.
    pub fn stop(&mut self) -> Option<SessionReport> {
        let report = self.session.stop();
        if self.active {
            self.video.stop();
            self.active = false;
            log::info!("stream service stopped");
        }
        report
    }

    pub fn restart(&mut self) -> Result<()> {
        self.stop();
        self.start()
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            active: self.active,
            streaming: self.session.is_active(),
            left_camera: self.video.camera(Side::Left).status(),
            right_camera: self.video.camera(Side::Right).status(),
            last_session: self.session.last_report().cloned(),
        }
    }

    /// Trigger autofocus. Returns false, without touching the cameras, when
    /// the service is inactive.
    pub fn focus(&self) -> Result<bool> {
        if !self.active {
            log::warn!("stream service inactive; focus ignored");
            return Ok(false);
        }
        self.video.focus()?;
        Ok(true)
    }

    /// Stream the fused, paced feed to `url` (or the configured URL).
    pub fn stream(&mut self, url: Option<&str>) -> Result<()> {
        if !self.active {
            return Err(anyhow!("stream service is not active; start it first"));
        }
        let url = url.unwrap_or(self.default_url.as_str()).to_string();
        if self.session.is_active() {
            log::warn!("already streaming; ignoring stream request for {}", url);
            return Ok(());
        }
        let feed = self.video.frames()?;
        let paced = BufferEngine::new(self.encoder.buffer_settings())?.buffer(feed)?;
        self.session.start(paced, &url)
    }

    pub fn handle(&mut self, command: StreamCommand) -> Result<ServiceStatus> {
        log::debug!("command: {:?}", command);
        match command {
            StreamCommand::Start => self.start()?,
            StreamCommand::Stop => {
                self.stop();
            }
            StreamCommand::Restart => self.restart()?,
            StreamCommand::Status => {}
            StreamCommand::Focus => {
                self.focus()?;
            }
            StreamCommand::Stream { url } => self.stream(url.as_deref())?,
        }
        Ok(self.status())
    }
}

impl Drop for StreamService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() -> Result<()> {
        assert_eq!("START".parse::<StreamCommand>()?, StreamCommand::Start);
        assert_eq!(" status ".parse::<StreamCommand>()?, StreamCommand::Status);
        assert_eq!(
            "stream rtmp://localhost/live/key".parse::<StreamCommand>()?,
            StreamCommand::Stream {
                url: Some("rtmp://localhost/live/key".to_string())
            }
        );
        assert_eq!(
            "stream".parse::<StreamCommand>()?,
            StreamCommand::Stream { url: None }
        );
        assert!("dance".parse::<StreamCommand>().is_err());
        assert!("stop now".parse::<StreamCommand>().is_err());
        assert!("".parse::<StreamCommand>().is_err());
        Ok(())
    }
}
