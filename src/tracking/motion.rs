use anyhow::{anyhow, Result};

use super::{DetectionData, MotionData, Point};

/// History for one camera side. Start from `MotionState::default()`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MotionState {
    previous: Option<MotionData>,
}

impl MotionState {
    pub fn previous(&self) -> Option<&MotionData> {
        self.previous.as_ref()
    }
}

/// Finite-difference motion estimate at a fixed sample interval.
///
/// `dt` is `1 / camera_fps`, not measured wall time: capture jitter would
/// otherwise show up as velocity spikes.
#[derive(Clone, Copy, Debug)]
pub struct MotionService {
    dt: f64,
}

impl MotionService {
    pub fn new(camera_fps: u32) -> Result<Self> {
        if camera_fps == 0 {
            return Err(anyhow!("camera fps must be >= 1"));
        }
        Ok(Self {
            dt: 1.0 / camera_fps as f64,
        })
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Advance `state` by one detection.
    ///
    /// The first call has no history and reports zero velocity and
    /// acceleration.
    pub fn calculate_motion(
        &self,
        state: &MotionState,
        detection: &DetectionData,
    ) -> (MotionState, MotionData) {
        let position = detection.ball.center;
        let motion = match state.previous {
            None => MotionData {
                position,
                velocity: Point::ZERO,
                acceleration: Point::ZERO,
            },
            Some(previous) => {
                let velocity = (position - previous.position) / self.dt;
                let acceleration = (velocity - previous.velocity) / self.dt;
                MotionData {
                    position,
                    velocity,
                    acceleration,
                }
            }
        };
        (
            MotionState {
                previous: Some(motion),
            },
            motion,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_has_no_motion() -> Result<()> {
        let service = MotionService::new(30)?;
        let (state, motion) =
            service.calculate_motion(&MotionState::default(), &DetectionData::ball_at(10.0, 20.0));
        assert_eq!(motion.velocity, Point::ZERO);
        assert_eq!(motion.acceleration, Point::ZERO);
        assert_eq!(motion.position, Point::new(10.0, 20.0));
        assert!(state.previous().is_some());
        Ok(())
    }

    #[test]
    fn velocity_and_acceleration_use_fixed_dt() -> Result<()> {
        let service = MotionService::new(10)?;
        let state = MotionState::default();
        let (state, _) = service.calculate_motion(&state, &DetectionData::ball_at(0.0, 0.0));
        let (state, second) = service.calculate_motion(&state, &DetectionData::ball_at(5.0, 0.0));
        assert!((second.velocity.x - 50.0).abs() < 1e-9);
        assert!((second.acceleration.x - 500.0).abs() < 1e-9);

        let (_, third) = service.calculate_motion(&state, &DetectionData::ball_at(10.0, 0.0));
        assert!((third.velocity.x - 50.0).abs() < 1e-9);
        assert!(third.acceleration.x.abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn identical_input_differs_once_history_differs() -> Result<()> {
        let service = MotionService::new(30)?;
        let detection = DetectionData::ball_at(100.0, 100.0);
        let (_, fresh) = service.calculate_motion(&MotionState::default(), &detection);

        let (moved, _) =
            service.calculate_motion(&MotionState::default(), &DetectionData::ball_at(0.0, 0.0));
        let (_, with_history) = service.calculate_motion(&moved, &detection);

        assert_ne!(fresh, with_history);
        Ok(())
    }

    #[test]
    fn sides_do_not_share_history() -> Result<()> {
        let service = MotionService::new(30)?;
        let left = MotionState::default();
        let right = MotionState::default();
        let (left, _) = service.calculate_motion(&left, &DetectionData::ball_at(0.0, 0.0));
        let (_, right_motion) = service.calculate_motion(&right, &DetectionData::ball_at(50.0, 0.0));
        assert_eq!(right_motion.velocity, Point::ZERO);
        assert!(left.previous().is_some());
        Ok(())
    }

    #[test]
    fn zero_fps_is_rejected() {
        assert!(MotionService::new(0).is_err());
    }
}
