//! Detection seam.
//!
//! Ball, court and player localisation happens outside this crate. A
//! `DetectionProvider` hands the pipeline whatever the external detector found
//! for one camera frame; the providers here are the stand-ins used by the
//! demo binary and the tests.

use anyhow::Result;
use std::collections::VecDeque;

use crate::frame::Frame;
use crate::tracking::{DetectionData, Point, Side};

/// Source of per-frame detections.
///
/// Called once per camera per tick, left before right. Returning `Ok(None)`
/// means nothing was detected in that frame.
pub trait DetectionProvider: Send {
    fn name(&self) -> &'static str;

    fn detect(&mut self, side: Side, frame: &Frame) -> Result<Option<DetectionData>>;
}

/// Reports the ball at the centre of every frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct CenterDetections;

impl DetectionProvider for CenterDetections {
    fn name(&self) -> &'static str {
        "center"
    }

    fn detect(&mut self, _side: Side, frame: &Frame) -> Result<Option<DetectionData>> {
        Ok(Some(DetectionData::ball_at(
            frame.width as f64 / 2.0,
            frame.height as f64 / 2.0,
        )))
    }
}

/// Plays back a fixed list of detections per side, then reports nothing.
#[derive(Clone, Debug, Default)]
pub struct ScriptedDetections {
    left: VecDeque<Option<DetectionData>>,
    right: VecDeque<Option<DetectionData>>,
}

impl ScriptedDetections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one tick's detections for both cameras.
    pub fn push(mut self, left: Option<DetectionData>, right: Option<DetectionData>) -> Self {
        self.left.push_back(left);
        self.right.push_back(right);
        self
    }

    pub fn remaining(&self) -> usize {
        self.left.len().max(self.right.len())
    }
}

impl DetectionProvider for ScriptedDetections {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, side: Side, _frame: &Frame) -> Result<Option<DetectionData>> {
        let queue = match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        };
        Ok(queue.pop_front().flatten())
    }
}

/// Moves a ball across the combined field of view and back.
///
/// The ball travels along the panorama formed by both cameras, so it crosses
/// the shared band and exercises the side decision. Players trail the ball.
#[derive(Clone, Debug)]
pub struct SweepDetections {
    overlap: u32,
    step: f64,
    players: usize,
    position: f64,
    direction: f64,
}

impl SweepDetections {
    /// `step` is the distance, in pixels, the ball moves per tick.
    pub fn new(overlap: u32, step: f64, players: usize) -> Self {
        Self {
            overlap,
            step: step.abs().max(1.0),
            players,
            position: 0.0,
            direction: 1.0,
        }
    }

    fn detection(&self, x: f64, frame: &Frame) -> Option<DetectionData> {
        if x < 0.0 || x > frame.width as f64 {
            return None;
        }
        let y = frame.height as f64 / 2.0;
        let players = (0..self.players).map(|i| Point::new(x - 40.0 * (i as f64 + 1.0), y + 20.0));
        Some(DetectionData::ball_at(x, y).with_players(players))
    }
}

impl DetectionProvider for SweepDetections {
    fn name(&self) -> &'static str {
        "sweep"
    }

    fn detect(&mut self, side: Side, frame: &Frame) -> Result<Option<DetectionData>> {
        let width = frame.width as f64;
        let offset = width - self.overlap.min(frame.width) as f64;
        let detection = match side {
            Side::Left => self.detection(self.position, frame),
            Side::Right => {
                let found = self.detection(self.position - offset, frame);
                // Right is asked last; advance once per tick.
                let span = offset + width;
                self.position += self.step * self.direction;
                if self.position >= span || self.position <= 0.0 {
                    self.position = self.position.clamp(0.0, span);
                    self.direction = -self.direction;
                }
                found
            }
        };
        Ok(detection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn frame() -> Frame {
        Frame::solid(200, 100, PixelFormat::Bgr24, [0, 0, 0], 0.0)
    }

    #[test]
    fn center_reports_frame_centre() -> Result<()> {
        let found = CenterDetections.detect(Side::Left, &frame())?;
        assert_eq!(found.map(|d| d.ball.center), Some(Point::new(100.0, 50.0)));
        Ok(())
    }

    #[test]
    fn scripted_plays_back_then_runs_dry() -> Result<()> {
        let mut provider = ScriptedDetections::new()
            .push(Some(DetectionData::ball_at(1.0, 1.0)), None)
            .push(None, Some(DetectionData::ball_at(2.0, 2.0)));
        let frame = frame();
        assert!(provider.detect(Side::Left, &frame)?.is_some());
        assert!(provider.detect(Side::Right, &frame)?.is_none());
        assert!(provider.detect(Side::Left, &frame)?.is_none());
        assert!(provider.detect(Side::Right, &frame)?.is_some());
        assert_eq!(provider.remaining(), 0);
        assert!(provider.detect(Side::Left, &frame)?.is_none());
        Ok(())
    }

    #[test]
    fn sweep_hands_ball_from_left_to_right() -> Result<()> {
        let mut provider = SweepDetections::new(50, 60.0, 2);
        let frame = frame();
        let mut seen_right_only = false;
        for _ in 0..6 {
            let left = provider.detect(Side::Left, &frame)?;
            let right = provider.detect(Side::Right, &frame)?;
            if left.is_none() && right.is_some() {
                seen_right_only = true;
            }
        }
        assert!(seen_right_only);
        Ok(())
    }
}
