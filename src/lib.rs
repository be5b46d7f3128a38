//! Dual-camera live streaming core.
//!
//! This crate captures frames from two cameras, decides which camera owns the
//! ball, crops and zooms on it, paces the result to a fixed output cadence,
//! and encodes it into a live FLV/RTMP stream.
//!
//! # Data flow
//!
//! ```text
//! Camera x2 ──► VideoService (preprocess ► detect ► track ► zoom ► transform)
//!                    │
//!                    ▼
//!              BufferEngine (pace, frame hold, newest wins)
//!                    │
//!                    ▼
//!              StreamSession (H.264 encode ► FLV mux ► network)
//! ```
//!
//! # Module Structure
//!
//! - `frame`: `Frame`, monotonic clock, crop/transform
//! - `camera`: camera capability trait, capture threads, device profiles
//! - `detect`: seam for externally supplied ball/player detections
//! - `tracking`: motion, side decision, zoom (explicit state)
//! - `pipeline`: stage list and the `VideoService` orchestrator
//! - `buffer`: fixed-cadence buffer engine
//! - `stream`: encode/mux session
//! - `service`: lifecycle glue and command dispatch
//! - `config`: file + environment configuration

use std::time::Duration;

pub mod buffer;
pub mod camera;
pub mod config;
pub mod detect;
pub mod frame;
pub mod pipeline;
pub mod service;
pub mod stream;
pub mod tracking;

pub use buffer::{BufferEngine, BufferSettings, BufferStats, PacedFeed};
pub use camera::profile::{CameraProfile, CaptureMode, Device, Lens, RigGeometry, Sensor};
pub use camera::{Camera, FrameGrabber, SyntheticGrabber, ThreadedCamera};
pub use config::RigConfig;
pub use detect::{CenterDetections, DetectionProvider, ScriptedDetections};
pub use frame::{monotonic_seconds, CropWindow, Frame, PixelFormat};
pub use pipeline::{Flow, Pipeline, Stage, Tick, VideoService};
pub use service::{StreamCommand, StreamService};
pub use stream::{
    EncoderSettings, MuxSink, NullSink, SessionOutcome, SessionReport, StreamProtocol,
    StreamSession,
};
pub use tracking::{
    DetectionData, MotionData, MotionService, MotionState, Point, Side, SideDecision,
    SideDecisionService, ZoomData, ZoomService, ZoomState,
};

// -------------------- Error taxonomy --------------------

/// Failures the pipeline distinguishes between.
///
/// Travels inside `anyhow::Error`; use `PipelineError::classify` (or
/// `downcast_ref`) to recover the variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// A camera read exceeded its deadline.
    CaptureTimeout { camera: usize, waited: Duration },
    /// The buffer engine's producer failed; ends that buffering session.
    ProducerFailure(String),
    /// The muxer reported an unexpected end of stream.
    EncoderEof,
    /// Any other encode/mux I/O failure.
    MuxerIo(String),
    /// Unsupported device, sensor or profile. Fatal at startup.
    Configuration(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::CaptureTimeout { .. } => "CAPTURE_TIMEOUT",
            PipelineError::ProducerFailure(_) => "PRODUCER_FAILURE",
            PipelineError::EncoderEof => "ENCODER_EOF",
            PipelineError::MuxerIo(_) => "MUXER_IO",
            PipelineError::Configuration(_) => "CONFIGURATION",
        }
    }

    /// The pipeline error carried by `err`, if any.
    pub fn classify(err: &anyhow::Error) -> Option<&PipelineError> {
        err.downcast_ref::<PipelineError>()
    }

    pub fn config(message: impl Into<String>) -> anyhow::Error {
        PipelineError::Configuration(message.into()).into()
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::CaptureTimeout { camera, waited } => write!(
                f,
                "{}: camera {} delivered no frame within {} ms",
                self.code(),
                camera,
                waited.as_millis()
            ),
            PipelineError::ProducerFailure(reason)
            | PipelineError::MuxerIo(reason)
            | PipelineError::Configuration(reason) => write!(f, "{}: {}", self.code(), reason),
            PipelineError::EncoderEof => write!(f, "{}: muxer reached end of stream", self.code()),
        }
    }
}

impl std::error::Error for PipelineError {}
