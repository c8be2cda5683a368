//! Velocity integration and aerial movement for kinematic character
//! controllers.
//!
//! Two pieces do the work:
//!
//! - [`velocity::calc_velocity`] integrates per-tick velocity from input
//!   acceleration, with ground braking, fluid drag, and an air-strafe branch
//!   that rewards steering away from the current direction of travel.
//! - [`falling::FallingStepper`] simulates airborne movement in bounded
//!   sub-steps: gravity, swept collision moves, slide and two-wall
//!   deflection, and landing detection.
//!
//! The falling stepper talks to the world through the
//! [`falling::FallingEnvironment`] trait; [`sweep::SweptMove`] provides the
//! avian3d-backed swept moves an implementation needs. Conventions
//! throughout: Y is up, units are centimeters and seconds.

use bevy::prelude::*;

pub mod config;
pub mod falling;
pub mod kinematics;
pub mod sweep;
pub mod velocity;

pub mod prelude {
    pub use crate::config::MovementConfig;
    pub use crate::falling::{FallingEnvironment, FallingOutcome, FallingStepper};
    pub use crate::kinematics::{ImpactRecord, KinematicState, MovementMode, TickBudget};
    pub use crate::sweep::{is_walkable, MoveHit, SweptMove};
    pub use crate::velocity::{
        apply_velocity_braking, calc_velocity, RequestedMove, SolveContext,
    };
    pub use crate::FreefallPlugin;
}

/// Registers the movement types for reflection. The simulation itself is
/// driven by the caller; this crate adds no systems.
pub struct FreefallPlugin;

impl Plugin for FreefallPlugin {
    fn build(&self, app: &mut App) {
        app.register_type::<config::MovementConfig>()
            .register_type::<kinematics::KinematicState>()
            .register_type::<kinematics::MovementMode>()
            .register_type::<kinematics::ImpactRecord>();
    }
}
