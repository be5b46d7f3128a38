use anyhow::{Context, Result};

use super::{Flow, Stage, Tick};
use crate::detect::DetectionProvider;
use crate::frame::{transform, CropWindow};
use crate::tracking::{
    MotionService, MotionState, Side, SideDecision, SideDecisionService, ZoomData, ZoomService,
    ZoomState,
};

/// Gaussian denoise of both camera frames.
pub struct PreprocessStage {
    sigma: f32,
}

impl PreprocessStage {
    pub fn new(sigma: f32) -> Self {
        Self { sigma }
    }
}

impl Stage for PreprocessStage {
    fn name(&self) -> &'static str {
        "preprocess"
    }

    fn next(&mut self, mut tick: Tick) -> Result<Flow> {
        if self.sigma > 0.0 {
            tick.left = tick.left.denoise(self.sigma)?;
            tick.right = tick.right.denoise(self.sigma)?;
        }
        Ok(Flow::Continue(tick))
    }
}

/// Asks the external detector about both frames.
pub struct DetectStage {
    provider: Box<dyn DetectionProvider>,
}

impl DetectStage {
    pub fn new(provider: Box<dyn DetectionProvider>) -> Self {
        Self { provider }
    }
}

impl Stage for DetectStage {
    fn name(&self) -> &'static str {
        "detect"
    }

    fn next(&mut self, mut tick: Tick) -> Result<Flow> {
        tick.left_detection = self
            .provider
            .detect(Side::Left, &tick.left)
            .with_context(|| format!("{} detector on left frame", self.provider.name()))?;
        tick.right_detection = self
            .provider
            .detect(Side::Right, &tick.right)
            .with_context(|| format!("{} detector on right frame", self.provider.name()))?;
        Ok(Flow::Continue(tick))
    }
}

/// Per-side motion plus the side decision.
///
/// With detections on both sides the blended decision applies. With a
/// detection on one side only, the ball is visible to that camera alone and
/// that side wins outright. With none, the previous decision stands.
pub struct TrackStage {
    motion: MotionService,
    side: SideDecisionService,
    left_state: MotionState,
    right_state: MotionState,
    last_decision: SideDecision,
}

impl TrackStage {
    pub fn new(motion: MotionService, side: SideDecisionService) -> Self {
        Self {
            motion,
            side,
            left_state: MotionState::default(),
            right_state: MotionState::default(),
            last_decision: SideDecision {
                side: Side::Left,
                confidence: 0.0,
            },
        }
    }
}

impl Stage for TrackStage {
    fn name(&self) -> &'static str {
        "track"
    }

    fn next(&mut self, mut tick: Tick) -> Result<Flow> {
        if let Some(detection) = &tick.left_detection {
            let (state, motion) = self.motion.calculate_motion(&self.left_state, detection);
            self.left_state = state;
            tick.left_motion = Some(motion);
        }
        if let Some(detection) = &tick.right_detection {
            let (state, motion) = self.motion.calculate_motion(&self.right_state, detection);
            self.right_state = state;
            tick.right_motion = Some(motion);
        }

        let decision = match (&tick.left_motion, &tick.right_motion) {
            (Some(left), Some(right)) => self.side.decide_side(left, right),
            (Some(_), None) => SideDecision {
                side: Side::Left,
                confidence: 1.0,
            },
            (None, Some(_)) => SideDecision {
                side: Side::Right,
                confidence: 1.0,
            },
            (None, None) => self.last_decision,
        };
        if decision.side != self.last_decision.side {
            log::debug!(
                "tick {}: switching to {} camera (confidence {:.3})",
                tick.index,
                decision.side.name(),
                decision.confidence
            );
        }
        self.last_decision = decision;
        tick.decision = Some(decision);
        Ok(Flow::Continue(tick))
    }
}

/// Smoothed zoom on the selected side; holds the last zoom without a fresh
/// detection there.
pub struct ZoomStage {
    service: ZoomService,
    state: ZoomState,
    last: Option<ZoomData>,
}

impl ZoomStage {
    pub fn new(service: ZoomService) -> Self {
        Self {
            service,
            state: ZoomState::default(),
            last: None,
        }
    }
}

impl Stage for ZoomStage {
    fn name(&self) -> &'static str {
        "zoom"
    }

    fn next(&mut self, mut tick: Tick) -> Result<Flow> {
        let side = tick.selected_side();
        if let (Some(detection), Some(motion)) = (tick.detection(side), tick.motion(side)) {
            let (state, zoom) = self.service.calculate_zoom(&self.state, detection, motion);
            self.state = state;
            self.last = Some(zoom);
        }
        tick.zoom = self.last;
        Ok(Flow::Continue(tick))
    }
}

/// Crops the selected frame to the zoom window and resizes to the output.
pub struct TransformStage {
    output: (u32, u32),
}

impl TransformStage {
    pub fn new(output: (u32, u32)) -> Self {
        Self { output }
    }
}

impl Stage for TransformStage {
    fn name(&self) -> &'static str {
        "transform"
    }

    fn next(&mut self, mut tick: Tick) -> Result<Flow> {
        let frame = tick.frame(tick.selected_side());
        let window = match &tick.zoom {
            Some(zoom) => CropWindow::for_zoom(frame.width, frame.height, zoom),
            None => CropWindow::full(frame.width, frame.height),
        };
        let output = transform(frame, window, self.output)?;
        tick.output = Some(output);
        Ok(Flow::Continue(tick))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ScriptedDetections;
    use crate::frame::{Frame, PixelFormat};
    use crate::tracking::DetectionData;

    fn tick(index: u64) -> Tick {
        Tick::new(
            index,
            Frame::solid(64, 36, PixelFormat::Bgr24, [255, 0, 0], index as f64),
            Frame::solid(64, 36, PixelFormat::Bgr24, [0, 0, 255], index as f64),
        )
    }

    fn track() -> Result<TrackStage> {
        Ok(TrackStage::new(
            MotionService::new(30)?,
            SideDecisionService::new(64, 8)?,
        ))
    }

    fn expect_continue(flow: Flow) -> Tick {
        match flow {
            Flow::Continue(tick) => tick,
            other => panic!("expected Continue, got {:?}", other),
        }
    }

    #[test]
    fn single_sided_detection_wins_outright() -> Result<()> {
        let mut stage = track()?;
        let mut t = tick(0);
        t.right_detection = Some(DetectionData::ball_at(30.0, 10.0));
        let t = expect_continue(stage.next(t)?);
        assert_eq!(
            t.decision,
            Some(SideDecision {
                side: Side::Right,
                confidence: 1.0
            })
        );
        Ok(())
    }

    #[test]
    fn no_detection_keeps_previous_decision() -> Result<()> {
        let mut stage = track()?;
        let t = expect_continue(stage.next(tick(0))?);
        assert_eq!(t.decision.map(|d| d.side), Some(Side::Left));

        let mut t = tick(1);
        t.right_detection = Some(DetectionData::ball_at(30.0, 10.0));
        stage.next(t)?;
        let t = expect_continue(stage.next(tick(2))?);
        assert_eq!(t.decision.map(|d| d.side), Some(Side::Right));
        Ok(())
    }

    #[test]
    fn zoom_is_held_without_detection() -> Result<()> {
        let mut detect = DetectStage::new(Box::new(
            ScriptedDetections::new().push(Some(DetectionData::ball_at(20.0, 18.0)), None),
        ));
        let mut track = track()?;
        let mut zoom = ZoomStage::new(ZoomService::default());

        let first = expect_continue(detect.next(tick(0))?);
        let first = expect_continue(track.next(first)?);
        let first = expect_continue(zoom.next(first)?);
        let held = first.zoom;
        assert!(held.is_some());

        let second = expect_continue(detect.next(tick(1))?);
        let second = expect_continue(track.next(second)?);
        let second = expect_continue(zoom.next(second)?);
        assert_eq!(second.zoom, held);
        Ok(())
    }

    #[test]
    fn transform_uses_selected_side_and_full_frame_without_zoom() -> Result<()> {
        let mut stage = TransformStage::new((32, 18));
        let mut t = tick(0);
        t.decision = Some(SideDecision {
            side: Side::Right,
            confidence: 1.0,
        });
        let t = expect_continue(stage.next(t)?);
        let output = t.output.unwrap();
        assert_eq!((output.width, output.height), (32, 18));
        assert_eq!(&output.data()[..3], &[0, 0, 255]);
        Ok(())
    }
}
