//! Encode/mux session.
//!
//! A `StreamSession` owns one worker thread that pulls paced frames, stamps
//! them with strictly increasing pts, and pushes them through a `MuxSink`
//! (H.264 encoder + container). On every exit path the worker flushes the
//! encoder before closing the container, so viewers never receive a
//! truncated tail.
//!
//! Sinks:
//! - `NullSink`: discards frames, records what it was given.
//! - `FfmpegSink` (feature `stream-ffmpeg`): libx264 into FLV, to an RTMP
//!   URL or a local file.

mod null;
mod session;
mod settings;

#[cfg(feature = "stream-ffmpeg")]
mod ffmpeg;

use anyhow::Result;

use crate::frame::Frame;
use crate::PipelineError;

pub use null::{NullRecorder, NullSink, SinkCall};
pub use session::{PtsClock, SessionOutcome, SessionReport, StreamSession, WORKER_JOIN_TIMEOUT};
pub use settings::EncoderSettings;

#[cfg(feature = "stream-ffmpeg")]
pub use self::ffmpeg::FfmpegSink;

/// Where a stream goes, decided from its URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamProtocol {
    /// `rtmp://` or `rtmps://` live ingest.
    Rtmp,
    /// Local FLV file (`file://` URL or a path ending in `.flv`).
    File,
    /// `null://`: encode nothing, record pts only.
    Null,
}

impl StreamProtocol {
    pub fn from_url(target: &str) -> Result<Self> {
        let target = target.trim();
        if target.starts_with("null://") {
            return Ok(Self::Null);
        }
        if target.starts_with("rtmp://") || target.starts_with("rtmps://") {
            let parsed = url::Url::parse(target).map_err(|e| {
                PipelineError::config(format!("invalid stream URL '{}': {}", target, e))
            })?;
            if parsed.host_str().map_or(true, str::is_empty) {
                return Err(PipelineError::config(format!(
                    "stream URL '{}' has no host",
                    target
                )));
            }
            return Ok(Self::Rtmp);
        }
        if target.starts_with("file://") || target.to_ascii_lowercase().ends_with(".flv") {
            return Ok(Self::File);
        }
        Err(PipelineError::config(format!(
            "unsupported stream target '{}' (expected rtmp://, null:// or a .flv path)",
            target
        )))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Rtmp => "rtmp",
            Self::File => "file",
            Self::Null => "null",
        }
    }
}

/// Path on disk for a `File` target.
pub fn file_target_path(target: &str) -> Result<std::path::PathBuf> {
    let target = target.trim();
    if target.starts_with("file://") {
        let parsed = url::Url::parse(target).map_err(|e| {
            PipelineError::config(format!("invalid file URL '{}': {}", target, e))
        })?;
        return parsed
            .to_file_path()
            .map_err(|_| PipelineError::config(format!("'{}' is not a local file URL", target)));
    }
    Ok(std::path::PathBuf::from(target))
}

/// Encoder plus container.
///
/// `encode` and `flush` return the number of packets written. Errors carry
/// `PipelineError::EncoderEof` when the far end closed the stream and
/// `PipelineError::MuxerIo` for anything else.
pub trait MuxSink: Send {
    fn name(&self) -> &'static str;

    /// Encode one frame and mux every packet the encoder returns.
    fn encode(&mut self, frame: &Frame, pts: i64) -> Result<usize>;

    /// Drain the encoder.
    fn flush(&mut self) -> Result<usize>;

    /// Finish and release the container.
    fn close(&mut self) -> Result<()>;
}

/// Build the sink for `url`.
pub fn open_sink(url: &str, settings: &EncoderSettings) -> Result<Box<dyn MuxSink>> {
    settings.validate()?;
    match StreamProtocol::from_url(url)? {
        StreamProtocol::Null => Ok(Box::new(NullSink::new(settings.gop_size()))),
        #[cfg(feature = "stream-ffmpeg")]
        protocol @ (StreamProtocol::Rtmp | StreamProtocol::File) => {
            Ok(Box::new(FfmpegSink::open(url, protocol, settings)?))
        }
        #[cfg(not(feature = "stream-ffmpeg"))]
        protocol => Err(PipelineError::config(format!(
            "{} streaming requires the stream-ffmpeg feature",
            protocol.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_from_url() -> Result<()> {
        assert_eq!(
            StreamProtocol::from_url("rtmp://a.rtmp.youtube.com/live2/key")?,
            StreamProtocol::Rtmp
        );
        assert_eq!(StreamProtocol::from_url("null://")?, StreamProtocol::Null);
        assert_eq!(StreamProtocol::from_url("/tmp/out.flv")?, StreamProtocol::File);
        assert_eq!(StreamProtocol::from_url("file:///tmp/out.flv")?, StreamProtocol::File);
        Ok(())
    }

    #[test]
    fn bad_targets_are_configuration_errors() {
        for target in ["rtmp://", "http://example.com/live", "out.mp4"] {
            let err = StreamProtocol::from_url(target).unwrap_err();
            assert!(
                matches!(
                    PipelineError::classify(&err),
                    Some(PipelineError::Configuration(_))
                ),
                "{}",
                target
            );
        }
    }

    #[test]
    fn file_urls_resolve_to_paths() -> Result<()> {
        assert_eq!(
            file_target_path("file:///tmp/out.flv")?,
            std::path::PathBuf::from("/tmp/out.flv")
        );
        assert_eq!(file_target_path("out.flv")?, std::path::PathBuf::from("out.flv"));
        Ok(())
    }

    #[test]
    fn null_sink_opens_without_ffmpeg() -> Result<()> {
        let sink = open_sink("null://", &EncoderSettings::default())?;
        assert_eq!(sink.name(), "null");
        Ok(())
    }
}
