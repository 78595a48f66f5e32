//! Head pose and pose prediction

use glam::{Quat, Vec3};

/// Head pose sampled or predicted for one instant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseState {
    pub orientation: Quat,
    pub position: Vec3,
    pub angular_velocity: Vec3,
    pub linear_velocity: Vec3,
    pub time_in_seconds: f64,
}

impl PoseState {
    pub const IDENTITY: Self = Self {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
        angular_velocity: Vec3::ZERO,
        linear_velocity: Vec3::ZERO,
        time_in_seconds: 0.0,
    };

    pub fn from_orientation(orientation: Quat) -> Self {
        Self {
            orientation,
            ..Self::IDENTITY
        }
    }

    pub fn at_time(mut self, time_in_seconds: f64) -> Self {
        self.time_in_seconds = time_in_seconds;
        self
    }
}

impl Default for PoseState {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Source of predicted head poses, queried by the warp thread for each
/// scanout time point.
pub trait PosePredictor: Send + Sync {
    /// Predicted pose at an absolute time in seconds (see [`crate::time`]).
    fn predict(&self, abs_time_seconds: f64) -> PoseState;
}

/// Predictor that always answers the same pose. Useful when no sensor is
/// attached and in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedPose(pub PoseState);

impl PosePredictor for FixedPose {
    fn predict(&self, abs_time_seconds: f64) -> PoseState {
        self.0.at_time(abs_time_seconds)
    }
}

impl<F> PosePredictor for F
where
    F: Fn(f64) -> PoseState + Send + Sync,
{
    fn predict(&self, abs_time_seconds: f64) -> PoseState {
        self(abs_time_seconds)
    }
}
