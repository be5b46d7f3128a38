use anyhow::{anyhow, Result};

use super::{signed_ratio, MotionData, Side, SideDecision, DEFAULT_MAX_ACC, DEFAULT_MAX_SPEED};

/// Blend weights for the shared-band decision. Must sum to 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SideWeights {
    pub velocity: f64,
    pub acceleration: f64,
    pub distance: f64,
}

impl Default for SideWeights {
    fn default() -> Self {
        Self {
            velocity: 1.0 / 3.0,
            acceleration: 1.0 / 3.0,
            distance: 1.0 / 3.0,
        }
    }
}

/// Picks the camera that owns the ball.
///
/// Outside the overlap band the answer is absolute. Inside it, relative
/// velocity, relative acceleration and depth into the band are blended into
/// one score in `[-1, 1]`; negative means LEFT. A continuous score keeps the
/// choice from flapping when the ball sits on the band edge.
#[derive(Clone, Copy, Debug)]
pub struct SideDecisionService {
    frame_width: u32,
    overlap: u32,
    max_speed: f64,
    max_acc: f64,
    weights: SideWeights,
}

impl SideDecisionService {
    pub fn new(frame_width: u32, overlap: u32) -> Result<Self> {
        if overlap > frame_width {
            return Err(anyhow!(
                "overlap {}px is wider than the {}px frame",
                overlap,
                frame_width
            ));
        }
        Ok(Self {
            frame_width,
            overlap,
            max_speed: DEFAULT_MAX_SPEED,
            max_acc: DEFAULT_MAX_ACC,
            weights: SideWeights::default(),
        })
    }

    pub fn with_limits(mut self, max_speed: f64, max_acc: f64) -> Result<Self> {
        if max_speed <= 0.0 || max_acc <= 0.0 {
            return Err(anyhow!("max_speed and max_acc must be positive"));
        }
        self.max_speed = max_speed;
        self.max_acc = max_acc;
        Ok(self)
    }

    pub fn with_weights(mut self, weights: SideWeights) -> Result<Self> {
        let sum = weights.velocity + weights.acceleration + weights.distance;
        if (sum - 1.0).abs() > 0.02 {
            return Err(anyhow!("side decision weights must sum to 1 (got {:.3})", sum));
        }
        self.weights = weights;
        Ok(self)
    }

    pub fn overlap(&self) -> u32 {
        self.overlap
    }

    pub fn decide_side(&self, left: &MotionData, right: &MotionData) -> SideDecision {
        let left_limit = (self.frame_width - self.overlap) as f64;
        let right_limit = self.overlap as f64;
        let x_left = left.position.x;
        let x_right = right.position.x;

        if x_left < left_limit {
            return SideDecision {
                side: Side::Left,
                confidence: 1.0,
            };
        }
        if x_right > right_limit {
            return SideDecision {
                side: Side::Right,
                confidence: 1.0,
            };
        }

        let v_factor = signed_ratio(right.velocity.x - left.velocity.x, self.max_speed);
        let a_factor = signed_ratio(right.acceleration.x - left.acceleration.x, self.max_acc);
        let d_factor = if self.overlap == 0 {
            0.0
        } else {
            let overlap = self.overlap as f64;
            let left_depth = ((x_left - left_limit) / overlap).clamp(0.0, 1.0);
            let right_depth = ((right_limit - x_right) / overlap).clamp(0.0, 1.0);
            right_depth - left_depth
        };

        let combined = (self.weights.velocity * v_factor
            + self.weights.acceleration * a_factor
            + self.weights.distance * d_factor)
            .clamp(-1.0, 1.0);

        SideDecision {
            side: if combined >= 0.0 { Side::Right } else { Side::Left },
            confidence: combined.abs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::Point;

    fn at(x: f64) -> MotionData {
        MotionData {
            position: Point::new(x, 500.0),
            ..MotionData::default()
        }
    }

    fn moving(x: f64, vx: f64) -> MotionData {
        MotionData {
            velocity: Point::new(vx, 0.0),
            ..at(x)
        }
    }

    #[test]
    fn ball_only_in_left_camera() -> Result<()> {
        let service = SideDecisionService::new(1920, 100)?;
        let decision = service.decide_side(&at(0.0), &at(0.0));
        assert_eq!(decision.side, Side::Left);
        assert_eq!(decision.confidence, 1.0);
        Ok(())
    }

    #[test]
    fn ball_only_in_right_camera() -> Result<()> {
        let service = SideDecisionService::new(1920, 100)?;
        let decision = service.decide_side(&at(1900.0), &at(1920.0));
        assert_eq!(decision.side, Side::Right);
        assert_eq!(decision.confidence, 1.0);
        Ok(())
    }

    #[test]
    fn shared_band_blends_velocity() -> Result<()> {
        let service = SideDecisionService::new(1920, 100)?.with_limits(2000.0, 5000.0)?;
        // Both balls sit exactly on their outer band edge, so depth cancels out.
        let decision = service.decide_side(&moving(1820.0, 0.0), &moving(100.0, 500.0));
        assert_eq!(decision.side, Side::Right);
        assert!((decision.confidence - 0.25 / 3.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn shared_band_leans_left_when_left_is_faster() -> Result<()> {
        let service = SideDecisionService::new(1920, 100)?;
        let decision = service.decide_side(&moving(1820.0, 4000.0), &moving(100.0, 0.0));
        assert_eq!(decision.side, Side::Left);
        assert!((decision.confidence - 1.0 / 3.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn depth_into_band_favours_the_deeper_camera() -> Result<()> {
        let service = SideDecisionService::new(1920, 100)?;
        // Deep into the right camera's band, barely into the left one's.
        let decision = service.decide_side(&at(1820.0), &at(0.0));
        assert_eq!(decision.side, Side::Right);
        assert!((decision.confidence - 1.0 / 3.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn confidence_stays_in_unit_range() -> Result<()> {
        let service = SideDecisionService::new(1920, 100)?;
        let left = MotionData {
            position: Point::new(1920.0, 0.0),
            velocity: Point::new(-1e9, 0.0),
            acceleration: Point::new(-1e9, 0.0),
        };
        let right = MotionData {
            position: Point::new(0.0, 0.0),
            velocity: Point::new(1e9, 0.0),
            acceleration: Point::new(1e9, 0.0),
        };
        let decision = service.decide_side(&left, &right);
        assert!(decision.confidence <= 1.0);
        assert!(decision.confidence >= 0.0);
        Ok(())
    }

    #[test]
    fn rejects_bad_weights_and_overlap() {
        assert!(SideDecisionService::new(100, 200).is_err());
        let service = SideDecisionService::new(1920, 100).unwrap();
        let weights = SideWeights {
            velocity: 0.5,
            acceleration: 0.5,
            distance: 0.5,
        };
        assert!(service.with_weights(weights).is_err());
    }
}
