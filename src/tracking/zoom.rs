use anyhow::{anyhow, Result};

use super::{DetectionData, MotionData, ZoomData, DEFAULT_MAX_ACC, DEFAULT_MAX_SPEED};

/// Default radius, in pixels, within which a player counts as near the ball.
pub const DEFAULT_NEAR_BALL_RADIUS: f64 = 100.0;
/// Default weight of the new sample in the exponential smoothing.
pub const DEFAULT_SMOOTHING: f64 = 0.7;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ZoomWeights {
    pub speed: f64,
    pub acceleration: f64,
    pub players: f64,
}

impl Default for ZoomWeights {
    fn default() -> Self {
        Self {
            speed: 1.0 / 3.0,
            acceleration: 1.0 / 3.0,
            players: 1.0 / 3.0,
        }
    }
}

/// Previous smoothed zoom level for one output feed.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ZoomState {
    previous: Option<f64>,
}

impl ZoomState {
    pub fn with_previous(level: f64) -> Self {
        Self {
            previous: Some(level),
        }
    }

    pub fn previous(&self) -> Option<f64> {
        self.previous
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ZoomService {
    near_ball_radius: f64,
    max_speed: f64,
    max_acc: f64,
    weights: ZoomWeights,
    smoothing: f64,
}

impl Default for ZoomService {
    fn default() -> Self {
        Self {
            near_ball_radius: DEFAULT_NEAR_BALL_RADIUS,
            max_speed: DEFAULT_MAX_SPEED,
            max_acc: DEFAULT_MAX_ACC,
            weights: ZoomWeights::default(),
            smoothing: DEFAULT_SMOOTHING,
        }
    }
}

impl ZoomService {
    pub fn new(
        near_ball_radius: f64,
        max_speed: f64,
        max_acc: f64,
        weights: ZoomWeights,
        smoothing: f64,
    ) -> Result<Self> {
        if max_speed <= 0.0 || max_acc <= 0.0 {
            return Err(anyhow!("max_speed and max_acc must be positive"));
        }
        if !(0.0..=1.0).contains(&smoothing) {
            return Err(anyhow!("zoom smoothing must be within 0..=1 (got {})", smoothing));
        }
        let sum = weights.speed + weights.acceleration + weights.players;
        if (sum - 1.0).abs() > 0.02 {
            return Err(anyhow!("zoom weights must sum to 1 (got {:.3})", sum));
        }
        Ok(Self {
            near_ball_radius,
            max_speed,
            max_acc,
            weights,
            smoothing,
        })
    }

    /// Unsmoothed zoom level in `[0, 1]`.
    pub fn raw_level(&self, detection: &DetectionData, motion: &MotionData) -> f64 {
        let speed = (motion.speed() / self.max_speed).min(1.0);
        let acc = (motion.acc() / self.max_acc).min(1.0);
        let players = if detection.players.is_empty() {
            0.0
        } else {
            let near = detection
                .players
                .iter()
                .filter(|p| p.distance_to_ball(&detection.ball) < self.near_ball_radius)
                .count();
            (near as f64 / detection.players.len() as f64).min(1.0)
        };
        (self.weights.speed * speed + self.weights.acceleration * acc + self.weights.players * players)
            .clamp(0.0, 1.0)
    }

    /// `alpha * raw + (1 - alpha) * previous`; the first sample passes through.
    pub fn smooth(&self, state: &ZoomState, raw: f64) -> f64 {
        match state.previous {
            Some(previous) => self.smoothing * raw + (1.0 - self.smoothing) * previous,
            None => raw,
        }
    }

    pub fn calculate_zoom(
        &self,
        state: &ZoomState,
        detection: &DetectionData,
        motion: &MotionData,
    ) -> (ZoomState, ZoomData) {
        let level = self.smooth(state, self.raw_level(detection, motion));
        (
            ZoomState {
                previous: Some(level),
            },
            ZoomData {
                center: detection.ball.center,
                zoom_level: level,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::Point;

    #[test]
    fn smoothing_blends_with_previous() {
        let service = ZoomService::default();
        let smoothed = service.smooth(&ZoomState::with_previous(0.5), 1.0);
        assert!((smoothed - 0.85).abs() < 1e-9);
    }

    #[test]
    fn first_sample_is_not_smoothed() {
        let service = ZoomService::default();
        assert_eq!(service.smooth(&ZoomState::default(), 0.4), 0.4);
    }

    #[test]
    fn raw_level_saturates_each_signal() {
        let service = ZoomService::default();
        let detection = DetectionData::ball_at(500.0, 500.0)
            .with_players([Point::new(510.0, 500.0), Point::new(1500.0, 500.0)]);
        let motion = MotionData {
            position: Point::new(500.0, 500.0),
            velocity: Point::new(4000.0, 0.0),
            acceleration: Point::new(0.0, 2500.0),
        };
        let raw = service.raw_level(&detection, &motion);
        let expected = (1.0 + 0.5 + 0.5) / 3.0;
        assert!((raw - expected).abs() < 1e-9);
    }

    #[test]
    fn no_players_and_no_motion_is_wide() {
        let service = ZoomService::default();
        let detection = DetectionData::ball_at(10.0, 10.0);
        let (state, zoom) = service.calculate_zoom(
            &ZoomState::default(),
            &detection,
            &MotionData::default(),
        );
        assert_eq!(zoom.zoom_level, 0.0);
        assert_eq!(zoom.center, Point::new(10.0, 10.0));
        assert_eq!(state.previous(), Some(0.0));
    }

    #[test]
    fn rejects_out_of_range_smoothing() {
        let result = ZoomService::new(100.0, 2000.0, 5000.0, ZoomWeights::default(), 1.5);
        assert!(result.is_err());
    }
}
