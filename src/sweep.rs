//! Swept-move execution against the avian3d collision world.
//!
//! [`SweptMove`] turns spatial shape casts into the [`ImpactRecord`]s the
//! falling stepper consumes. All casts keep a skin-width gap to geometry so
//! repeated moves never accumulate into penetration.

use avian3d::prelude::*;
use bevy::{ecs::system::SystemParam, prelude::*};

use crate::kinematics::{ImpactRecord, KinematicState, SMALL_NUMBER};

/// Needed to not accidentally explode when `n.dot(dir)` happens to be very
/// close to zero.
const DOT_EPSILON: f32 = 0.005;

/// Minimal distance kept between the swept shape and any collider.
pub const DEFAULT_SKIN_WIDTH: f32 = 0.01;

/// A [`SystemParam`] that performs swept collision moves for a kinematic
/// character shape.
#[derive(SystemParam)]
pub struct SweptMove<'w, 's> {
    pub query: SpatialQuery<'w, 's>,
}

/// Data related to a hit during a [`SweptMove::cast_move`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoveHit {
    /// The entity of the collider that was hit by the shape.
    pub entity: Entity,

    /// The maximum distance that is safe to move in the given direction so
    /// that the shape still keeps a distance of `skin_width` to the other
    /// colliders. Zero when the shape started off intersecting, or when the
    /// obstacle is already closer than `skin_width`.
    pub distance: f32,

    /// The raw distance to the next collision, not respecting skin width.
    pub collision_distance: f32,

    /// The hit point on the obstacle, expressed in world space.
    pub point: Vec3,

    /// The outward surface normal on the obstacle at `point`.
    pub impact_normal: Vec3,

    /// The contact normal on the swept shape, pointing away from the
    /// obstacle.
    pub normal: Vec3,
}

impl MoveHit {
    /// Whether the shape started off already intersecting another collider.
    pub fn intersects(self) -> bool {
        self.collision_distance == 0.0
    }
}

impl<'w, 's> SweptMove<'w, 's> {
    /// Sweeps `shape` along `movement` and reports the first blocking hit.
    #[must_use]
    pub fn cast_move(
        &self,
        shape: &Collider,
        origin: Vec3,
        rotation: Quat,
        movement: Vec3,
        skin_width: f32,
        filter: &SpatialQueryFilter,
    ) -> Option<MoveHit> {
        let (direction, distance) = Dir3::new_and_length(movement).unwrap_or((Dir3::X, 0.0));
        let hit = self.query.cast_shape(
            shape,
            origin,
            rotation,
            direction,
            &ShapeCastConfig::from_max_distance(distance),
            filter,
        )?;
        let safe_distance = if distance == 0.0 {
            0.0
        } else {
            Self::pull_back(hit, direction, skin_width)
        };
        Some(MoveHit {
            entity: hit.entity,
            distance: safe_distance,
            collision_distance: hit.distance,
            point: hit.point1,
            impact_normal: hit.normal1,
            normal: -hit.normal2,
        })
    }

    /// Reduces a hit distance so the moved shape keeps `skin_width` of
    /// clearance along the contact normal. Never negative.
    #[must_use]
    fn pull_back(hit: ShapeHitData, dir: Dir3, skin_width: f32) -> f32 {
        let dot = dir.dot(-hit.normal1).max(DOT_EPSILON);
        let skin_distance = skin_width / dot;
        (hit.distance - skin_distance).max(0.0)
    }

    /// Moves the character by `delta`, advancing `state.position` up to the
    /// first blocking contact, and reports the move in the stepper's impact
    /// format.
    pub fn sweep(
        &self,
        shape: &Collider,
        state: &mut KinematicState,
        delta: Vec3,
        skin_width: f32,
        filter: &SpatialQueryFilter,
    ) -> ImpactRecord {
        let attempted = delta.length();
        if attempted * attempted < SMALL_NUMBER {
            return ImpactRecord::clear();
        }
        let Some(hit) = self.cast_move(
            shape,
            state.position,
            state.rotation(),
            delta,
            skin_width,
            filter,
        ) else {
            state.position += delta;
            return ImpactRecord::clear();
        };

        let fraction = (hit.distance / attempted).clamp(0.0, 1.0);
        state.position += delta * fraction;
        ImpactRecord {
            blocking: true,
            normal: hit.normal,
            impact_normal: hit.impact_normal,
            fraction,
            start_penetrating: hit.intersects(),
        }
    }

    /// Casts straight down and reports the floor contact, if any. The
    /// returned record is blocking regardless of walkability; use
    /// [`is_walkable`] on its impact normal to classify it.
    pub fn probe_floor(
        &self,
        shape: &Collider,
        origin: Vec3,
        rotation: Quat,
        probe_distance: f32,
        skin_width: f32,
        filter: &SpatialQueryFilter,
    ) -> Option<ImpactRecord> {
        let hit = self.query.cast_shape(
            shape,
            origin,
            rotation,
            Dir3::NEG_Y,
            &ShapeCastConfig::from_max_distance(probe_distance),
            filter,
        )?;
        let safe_distance = Self::pull_back(hit, Dir3::NEG_Y, skin_width);
        Some(ImpactRecord {
            blocking: true,
            normal: -hit.normal2,
            impact_normal: hit.normal1,
            fraction: if probe_distance > 0.0 {
                (safe_distance / probe_distance).clamp(0.0, 1.0)
            } else {
                0.0
            },
            start_penetrating: hit.distance == 0.0,
        })
    }
}

/// Whether a surface normal is flat enough to stand on.
#[inline]
pub fn is_walkable(impact_normal: Vec3, walkable_floor_y: f32) -> bool {
    impact_normal.y >= walkable_floor_y
}
