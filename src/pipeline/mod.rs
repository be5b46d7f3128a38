//! Frame orchestration.
//!
//! `VideoService` drives both cameras and runs every captured pair through an
//! ordered list of stages:
//!
//! ```text
//! preprocess ► detect ► track ► zoom ► transform
//! ```
//!
//! Each stage takes a `Tick` and returns `Flow::Continue(tick)` with its
//! results filled in, or `Flow::End` to stop the feed. Stage history (motion,
//! last decision, last zoom) lives in the stage values themselves, so every
//! `frames()` call starts from scratch.

mod stages;

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::camera::Camera;
use crate::detect::DetectionProvider;
use crate::frame::Frame;
use crate::tracking::{
    DetectionData, MotionData, MotionService, Side, SideDecision, SideDecisionService, ZoomData,
    ZoomService,
};
use crate::PipelineError;

pub use stages::{DetectStage, PreprocessStage, TrackStage, TransformStage, ZoomStage};

/// Default number of back-to-back capture timeouts the feed absorbs.
pub const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: u32 = 10;

/// One captured pair moving through the stages.
#[derive(Clone, Debug)]
pub struct Tick {
    pub index: u64,
    pub left: Frame,
    pub right: Frame,
    pub left_detection: Option<DetectionData>,
    pub right_detection: Option<DetectionData>,
    pub left_motion: Option<MotionData>,
    pub right_motion: Option<MotionData>,
    pub decision: Option<SideDecision>,
    pub zoom: Option<ZoomData>,
    pub output: Option<Frame>,
}

impl Tick {
    pub fn new(index: u64, left: Frame, right: Frame) -> Self {
        Self {
            index,
            left,
            right,
            left_detection: None,
            right_detection: None,
            left_motion: None,
            right_motion: None,
            decision: None,
            zoom: None,
            output: None,
        }
    }

    /// Side chosen by the track stage, LEFT until one has run.
    pub fn selected_side(&self) -> Side {
        self.decision.map(|d| d.side).unwrap_or_default()
    }

    pub fn frame(&self, side: Side) -> &Frame {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn detection(&self, side: Side) -> Option<&DetectionData> {
        match side {
            Side::Left => self.left_detection.as_ref(),
            Side::Right => self.right_detection.as_ref(),
        }
    }

    pub fn motion(&self, side: Side) -> Option<&MotionData> {
        match side {
            Side::Left => self.left_motion.as_ref(),
            Side::Right => self.right_motion.as_ref(),
        }
    }
}

#[derive(Debug)]
pub enum Flow {
    Continue(Tick),
    End,
}

pub trait Stage: Send {
    fn name(&self) -> &'static str;

    fn next(&mut self, tick: Tick) -> Result<Flow>;
}

/// Ordered stage list.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// The standard five-stage fusion pipeline.
    pub fn standard(settings: &FusionSettings, detector: Box<dyn DetectionProvider>) -> Self {
        Self::new(vec![
            Box::new(PreprocessStage::new(settings.denoise_sigma)),
            Box::new(DetectStage::new(detector)),
            Box::new(TrackStage::new(settings.motion, settings.side)),
            Box::new(ZoomStage::new(settings.zoom)),
            Box::new(TransformStage::new(settings.output)),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run `tick` through every stage, stopping at the first `End`.
    pub fn run(&mut self, tick: Tick) -> Result<Flow> {
        let mut tick = tick;
        for stage in &mut self.stages {
            match stage.next(tick)? {
                Flow::Continue(next) => tick = next,
                other => return Ok(other),
            }
        }
        Ok(Flow::Continue(tick))
    }
}

/// Everything needed to build a fusion pipeline.
#[derive(Clone, Copy, Debug)]
pub struct FusionSettings {
    /// Output resolution (width, height).
    pub output: (u32, u32),
    /// 0 disables the denoise.
    pub denoise_sigma: f32,
    pub max_consecutive_timeouts: u32,
    pub motion: MotionService,
    pub side: SideDecisionService,
    pub zoom: ZoomService,
}

impl FusionSettings {
    /// Default tracking for cameras at `camera_fps` with the given frame
    /// width and overlap band.
    pub fn new(output: (u32, u32), camera_fps: u32, frame_width: u32, overlap: u32) -> Result<Self> {
        if output.0 == 0 || output.1 == 0 {
            return Err(PipelineError::config(format!(
                "output resolution {}x{} is empty",
                output.0, output.1
            )));
        }
        Ok(Self {
            output,
            denoise_sigma: 0.0,
            max_consecutive_timeouts: DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
            motion: MotionService::new(camera_fps)?,
            side: SideDecisionService::new(frame_width, overlap)?,
            zoom: ZoomService::default(),
        })
    }
}

/// Builds a fresh detector for each feed.
pub type DetectorFactory = Arc<dyn Fn() -> Box<dyn DetectionProvider> + Send + Sync>;

/// Drives the two cameras and produces the fused feed.
pub struct VideoService {
    left: Arc<dyn Camera>,
    right: Arc<dyn Camera>,
    settings: FusionSettings,
    detector: DetectorFactory,
}

impl VideoService {
    pub fn new(
        left: Arc<dyn Camera>,
        right: Arc<dyn Camera>,
        settings: FusionSettings,
        detector: DetectorFactory,
    ) -> Self {
        Self {
            left,
            right,
            settings,
            detector,
        }
    }

    pub fn settings(&self) -> &FusionSettings {
        &self.settings
    }

    pub fn camera(&self, side: Side) -> &Arc<dyn Camera> {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Start both cameras. If the right one fails, the left one is stopped
    /// again.
    pub fn start(&self) -> Result<()> {
        self.left.start()?;
        if let Err(err) = self.right.start() {
            self.left.stop();
            return Err(err);
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.left.stop();
        self.right.stop();
    }

    pub fn status(&self) -> bool {
        self.left.status() && self.right.status()
    }

    pub fn focus(&self) -> Result<()> {
        self.left.focus()?;
        self.right.focus()
    }

    /// A new fused feed over the running cameras.
    pub fn frames(&self) -> Result<FusedFeed> {
        if !self.status() {
            return Err(anyhow!("cameras are not running"));
        }
        let pipeline = Pipeline::standard(&self.settings, (self.detector)());
        log::info!(
            "fused feed: stages [{}], output {}x{}",
            pipeline.stage_names().join(", "),
            self.settings.output.0,
            self.settings.output.1
        );
        Ok(FusedFeed::new(
            self.left.clone(),
            self.right.clone(),
            pipeline,
            self.settings.max_consecutive_timeouts,
        ))
    }
}

/// Blocking iterator of fused frames.
///
/// Ends when either camera stops or a stage returns `Flow::End`. Yields an
/// error, then ends, on a capture or stage failure; capture timeouts are
/// absorbed until `max_consecutive_timeouts` is exceeded.
pub struct FusedFeed {
    left: Arc<dyn Camera>,
    right: Arc<dyn Camera>,
    pipeline: Pipeline,
    max_consecutive_timeouts: u32,
    consecutive_timeouts: u32,
    next_index: u64,
    last_timestamp: f64,
    done: bool,
}

impl FusedFeed {
    pub fn new(
        left: Arc<dyn Camera>,
        right: Arc<dyn Camera>,
        pipeline: Pipeline,
        max_consecutive_timeouts: u32,
    ) -> Self {
        Self {
            left,
            right,
            pipeline,
            max_consecutive_timeouts,
            consecutive_timeouts: 0,
            next_index: 0,
            last_timestamp: f64::NEG_INFINITY,
            done: false,
        }
    }

    fn cameras_running(&self) -> bool {
        self.left.status() && self.right.status()
    }

    fn capture_pair(&self) -> Result<(Frame, Frame)> {
        let left = self.left.capture()?;
        let right = self.right.capture()?;
        Ok((left, right))
    }

    fn fail(&mut self, err: anyhow::Error) -> Option<Result<Frame>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for FusedFeed {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if !self.cameras_running() {
                log::info!("fused feed: camera stopped, ending feed");
                self.done = true;
                return None;
            }

            let (left, right) = match self.capture_pair() {
                Ok(pair) => pair,
                Err(err) => {
                    let timed_out = matches!(
                        PipelineError::classify(&err),
                        Some(PipelineError::CaptureTimeout { .. })
                    );
                    if timed_out {
                        self.consecutive_timeouts += 1;
                        if self.consecutive_timeouts > self.max_consecutive_timeouts {
                            log::error!(
                                "fused feed: {} consecutive capture timeouts",
                                self.consecutive_timeouts
                            );
                            return self.fail(err);
                        }
                        log::debug!("fused feed: {:#}", err);
                        continue;
                    }
                    if !self.cameras_running() {
                        self.done = true;
                        return None;
                    }
                    log::error!("fused feed: capture failed: {:#}", err);
                    return self.fail(err);
                }
            };
            self.consecutive_timeouts = 0;

            let index = self.next_index;
            self.next_index += 1;
            match self.pipeline.run(Tick::new(index, left, right)) {
                Ok(Flow::Continue(tick)) => {
                    let Some(frame) = tick.output else {
                        return self.fail(anyhow!("pipeline produced no output frame"));
                    };
                    if frame.timestamp <= self.last_timestamp {
                        log::debug!(
                            "fused feed: skipping tick {} with stale timestamp {:.6}",
                            index,
                            frame.timestamp
                        );
                        continue;
                    }
                    self.last_timestamp = frame.timestamp;
                    return Some(Ok(frame));
                }
                Ok(Flow::End) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    log::error!("fused feed: pipeline failed on tick {}: {:#}", index, err);
                    return self.fail(err);
                }
            }
        }
    }
}
