//! Shared data model for the movement core: per-character kinematic state,
//! movement modes, sub-step bookkeeping and swept-move impact reports.
//!
//! Conventions: Y is up, units are centimeters and seconds.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

/// Ticks shorter than this are skipped entirely.
pub const MIN_TICK_TIME: f32 = 1e-6;

/// General-purpose epsilon for near-zero checks on distances and dot products.
pub const KINDA_SMALL_NUMBER: f32 = 1e-4;

/// Epsilon for squared-length checks before normalization.
pub const SMALL_NUMBER: f32 = 1e-8;

/// Kinematic state of one character, exclusively owned by that character and
/// mutated only by the solver and stepper during simulation.
#[derive(Component, Clone, Copy, Debug, PartialEq, Reflect)]
#[reflect(Component, Debug, PartialEq)]
pub struct KinematicState {
    pub position: Vec3,
    pub velocity: Vec3,
    /// Input-derived acceleration for the current tick.
    pub acceleration: Vec3,
    /// Heading in radians around Y.
    pub yaw: f32,
}

impl KinematicState {
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            acceleration: Vec3::ZERO,
            yaw: 0.0,
        }
    }

    /// Facing direction derived from the heading.
    pub fn forward(&self) -> Vec3 {
        Quat::from_rotation_y(self.yaw) * Vec3::NEG_Z
    }

    pub fn rotation(&self) -> Quat {
        Quat::from_rotation_y(self.yaw)
    }

    /// Horizontal speed, ignoring the vertical axis.
    pub fn horizontal_speed(&self) -> f32 {
        horizontal(self.velocity).length()
    }
}

impl Default for KinematicState {
    fn default() -> Self {
        Self::new(Vec3::ZERO)
    }
}

/// Movement mode of the owning state machine. This core only activates its
/// air-strafe and falling-deflection logic in [`MovementMode::Falling`];
/// the other modes exist so callers can hand us their current mode directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Reflect)]
pub enum MovementMode {
    Walking,
    #[default]
    Falling,
    Swimming,
    Flying,
    None,
    Custom(u8),
}

/// Remaining time and sub-step count for the current tick.
///
/// `remaining` only ever decreases (landing refunds unconsumed slice time
/// back before handing off, which still never exceeds the original budget),
/// and the sub-step count never exceeds the configured cap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickBudget {
    pub remaining: f32,
    pub iterations: u32,
}

impl TickBudget {
    pub fn new(delta_time: f32) -> Self {
        Self {
            remaining: delta_time,
            iterations: 0,
        }
    }

    /// Whether another sub-step may run under the given iteration cap.
    pub fn has_time(&self, iteration_cap: u32) -> bool {
        self.remaining >= MIN_TICK_TIME && self.iterations < iteration_cap
    }

    /// Carves the next sub-step out of the remaining time.
    ///
    /// Long remainders are halved (up to `max_step`) so early sub-steps stay
    /// small, and the final sub-step consumes whatever is left. The returned
    /// slice is never below [`MIN_TICK_TIME`].
    pub fn sub_step(&mut self, max_step: f32, iteration_cap: u32) -> f32 {
        self.iterations += 1;
        let mut slice = self.remaining;
        if slice > max_step && self.iterations < iteration_cap {
            slice = (slice * 0.5).min(max_step);
        }
        let slice = slice.max(MIN_TICK_TIME);
        self.remaining -= slice;
        slice
    }

    /// Returns unconsumed sub-step time after an early contact, so the
    /// landing handler sees the full leftover.
    pub fn refund(&mut self, unused: f32) {
        self.remaining += unused;
    }

    pub fn exhaust(&mut self) {
        self.remaining = 0.0;
    }
}

/// Report from one swept move. Produced per attempted move and consumed
/// immediately; never retained across sub-steps.
#[derive(Clone, Copy, Debug, PartialEq, Reflect, Serialize, Deserialize)]
#[reflect(Debug, PartialEq, Serialize, Deserialize)]
pub struct ImpactRecord {
    /// Whether the move was blocked before completing.
    pub blocking: bool,
    /// Contact normal on the moved shape.
    pub normal: Vec3,
    /// Surface normal of the geometry that was hit.
    pub impact_normal: Vec3,
    /// Fraction of the attempted displacement consumed before contact.
    /// `1.0` for an unobstructed move.
    pub fraction: f32,
    /// The shape already overlapped something when the move started.
    pub start_penetrating: bool,
}

impl ImpactRecord {
    /// An unobstructed move.
    pub const fn clear() -> Self {
        Self {
            blocking: false,
            normal: Vec3::Y,
            impact_normal: Vec3::Y,
            fraction: 1.0,
            start_penetrating: false,
        }
    }

    pub fn blocked(normal: Vec3, impact_normal: Vec3, fraction: f32) -> Self {
        Self {
            blocking: true,
            normal,
            impact_normal,
            fraction,
            start_penetrating: false,
        }
    }
}

impl Default for ImpactRecord {
    fn default() -> Self {
        Self::clear()
    }
}

/// Projection of a vector onto the horizontal plane.
#[inline]
pub fn horizontal(v: Vec3) -> Vec3 {
    Vec3::new(v.x, 0.0, v.z)
}

/// Replaces a non-finite vector with a finite fallback, or zero if the
/// fallback is bad too. Simulation output must never carry NaN/Inf.
#[inline]
pub fn sanitize(v: Vec3, fallback: Vec3) -> Vec3 {
    if v.is_finite() {
        v
    } else if fallback.is_finite() {
        fallback
    } else {
        Vec3::ZERO
    }
}
