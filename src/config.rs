//! Movement tunables, set once per character and read-only during
//! simulation. Loadable from RON entity files.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::Path;
use tracing::warn;

/// Flat set of tunables for the velocity solver and the falling stepper.
///
/// Defaults are centimeter-scale and preserve the empirically tuned
/// constants of the reference controller. The perch and strafe constants in
/// particular are tunables, not load-bearing behavior.
#[derive(Component, Clone, Copy, Debug, PartialEq, Reflect, Serialize, Deserialize)]
#[reflect(Component, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    /// Maximum speed at full analog input.
    pub max_speed: f32,
    /// Maximum magnitude of input acceleration.
    pub max_acceleration: f32,
    /// Scale applied to `max_speed` for partial analog input.
    pub analog_input_scale: f32,
    /// Replace input acceleration with `max_acceleration` along the best
    /// available direction (acceleration, then velocity, then facing).
    pub force_max_acceleration: bool,

    /// Ground friction; also the turning responsiveness factor.
    pub friction: f32,
    /// Constant deceleration applied while braking.
    pub braking_deceleration: f32,
    /// Use `braking_friction` instead of the contact friction while braking.
    pub use_separate_braking_friction: bool,
    pub braking_friction: f32,

    /// Lateral friction while airborne.
    pub falling_lateral_friction: f32,
    /// Braking deceleration while airborne.
    pub braking_deceleration_falling: f32,

    /// Enables the air-strafe accumulation branch while falling.
    pub air_strafe_enabled: bool,
    /// Scale on the strafe acceleration contribution.
    pub strafing_multiplier: f32,
    /// Minimum speed after the post-strafe renormalization.
    pub strafe_speed_floor: f32,

    /// Vertical acceleration, negative is down.
    pub gravity: f32,
    /// Initial vertical jump speed; the perch nudge reuses a fraction of it.
    pub jump_velocity: f32,
    /// Minimum Y component of a walkable surface normal (cosine of the
    /// steepest walkable slope).
    pub walkable_floor_y: f32,

    /// Radius within which a near-miss ledge contact may trigger the
    /// randomized escape nudge. Zero disables the nudge.
    pub perch_radius: f32,
    /// Max vertical movement per second of sub-step time that still counts
    /// as "stuck" for the perch nudge.
    pub perch_height_tolerance: f32,
    /// Max squared lateral movement per second of sub-step time that still
    /// counts as "stuck" for the perch nudge.
    pub perch_distance_tolerance: f32,
    /// Fraction of `max_speed`/`jump_velocity` used by the escape nudge.
    pub perch_nudge_scale: f32,

    /// Cap on sub-steps per tick. Guarantees termination on degenerate
    /// geometry.
    pub max_simulation_iterations: u32,
    /// Longest single sub-step; larger remainders get subdivided.
    pub max_simulation_time_step: f32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            max_speed: 600.0,
            max_acceleration: 2048.0,
            analog_input_scale: 1.0,
            force_max_acceleration: false,

            friction: 8.0,
            braking_deceleration: 2048.0,
            use_separate_braking_friction: false,
            braking_friction: 0.0,

            falling_lateral_friction: 0.0,
            braking_deceleration_falling: 0.0,

            air_strafe_enabled: true,
            strafing_multiplier: 1.0,
            strafe_speed_floor: 1.5,

            gravity: -980.0,
            jump_velocity: 420.0,
            walkable_floor_y: 0.71,

            perch_radius: 0.0,
            perch_height_tolerance: 0.2,
            perch_distance_tolerance: 4.0,
            perch_nudge_scale: 0.25,

            max_simulation_iterations: 8,
            max_simulation_time_step: 0.05,
        }
    }
}

impl MovementConfig {
    pub fn from_ron_str(s: &str) -> Result<Self, ron::error::SpannedError> {
        ron::de::from_str(s)
    }

    /// Loads a config from a RON file, falling back to defaults when the
    /// file is missing or malformed. Load failures are logged, not fatal.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let Ok(s) = read_to_string(path) else {
            warn!("no movement config at {}, using defaults", path.display());
            return Self::default();
        };
        Self::from_ron_str(&s)
            .map_err(|e| warn!("could not parse {}: {e}", path.display()))
            .unwrap_or_default()
    }
}
