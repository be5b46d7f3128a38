//! Dual-camera tracking fusion.
//!
//! Three services turn externally supplied detections into a camera choice
//! and a zoom:
//!
//! - `MotionService`: per-side velocity / acceleration estimate.
//! - `SideDecisionService`: which camera owns the ball, with confidence.
//! - `ZoomService`: smoothed zoom level centred on the ball.
//!
//! The services hold configuration only. History lives in explicit state
//! values (`MotionState`, `ZoomState`) that callers own and thread through
//! each call, so the left and right sides can never share history by accident.

mod motion;
mod side;
mod zoom;

pub use motion::{MotionService, MotionState};
pub use side::{SideDecisionService, SideWeights};
pub use zoom::{ZoomService, ZoomState, ZoomWeights, DEFAULT_NEAR_BALL_RADIUS, DEFAULT_SMOOTHING};

/// Default normalisation cap for ball speed, px/s.
pub const DEFAULT_MAX_SPEED: f64 = 2000.0;
/// Default normalisation cap for ball acceleration, px/s^2.
pub const DEFAULT_MAX_ACC: f64 = 5000.0;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn norm(self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn distance(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

impl std::ops::Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Div<f64> for Point {
    type Output = Point;

    fn div(self, rhs: f64) -> Point {
        Point::new(self.x / rhs, self.y / rhs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Side {
    #[default]
    Left,
    Right,
}

impl Side {
    pub fn name(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

// ----------------------------------------------------------------------------
// Detection input (supplied externally)
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BallDetection {
    pub center: Point,
    pub confidence: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlayerDetection {
    pub position: Point,
    pub confidence: f32,
}

impl PlayerDetection {
    pub fn distance_to_ball(&self, ball: &BallDetection) -> f64 {
        self.position.distance(ball.center)
    }
}

/// Court corners in frame pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Court {
    pub top_left: Point,
    pub top_right: Point,
    pub bottom_left: Point,
    pub bottom_right: Point,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CourtDetection {
    pub court: Court,
    pub confidence: f32,
}

/// Everything the detector reports for one frame of one camera.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionData {
    pub ball: BallDetection,
    pub court: CourtDetection,
    pub players: Vec<PlayerDetection>,
}

impl DetectionData {
    /// Detection with only a ball, no court and no players.
    pub fn ball_at(x: f64, y: f64) -> Self {
        Self {
            ball: BallDetection {
                center: Point::new(x, y),
                confidence: 1.0,
            },
            court: CourtDetection::default(),
            players: Vec::new(),
        }
    }

    pub fn with_players(mut self, players: impl IntoIterator<Item = Point>) -> Self {
        self.players = players
            .into_iter()
            .map(|position| PlayerDetection {
                position,
                confidence: 1.0,
            })
            .collect();
        self
    }
}

// ----------------------------------------------------------------------------
// Fusion outputs
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MotionData {
    pub position: Point,
    pub velocity: Point,
    pub acceleration: Point,
}

impl MotionData {
    pub fn speed(&self) -> f64 {
        self.velocity.norm()
    }

    pub fn acc(&self) -> f64 {
        self.acceleration.norm()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SideDecision {
    pub side: Side,
    /// 0..=1
    pub confidence: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ZoomData {
    pub center: Point,
    /// 0 = full frame, 1 = tightest crop.
    pub zoom_level: f64,
}

/// `sign(x) * min(|x| / cap, 1)`, with `sign(0) = +1`.
pub(crate) fn signed_ratio(value: f64, cap: f64) -> f64 {
    let magnitude = (value.abs() / cap).min(1.0);
    if value >= 0.0 {
        magnitude
    } else {
        -magnitude
    }
}
