//! Sub-stepped airborne movement: velocity integration with gravity, swept
//! collision moves, landing classification, and slide/two-wall deflection.
//!
//! [`FallingStepper::phys_falling`] drives one tick of falling movement.
//! The engine services it needs (swept moves, floor classification, air
//! control limiting) come in through the [`FallingEnvironment`] capability
//! interface, so the core carries no dependency on a particular scene or
//! physics backend.

use bevy::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::MovementConfig;
use crate::kinematics::{
    horizontal, ImpactRecord, KinematicState, MovementMode, TickBudget, KINDA_SMALL_NUMBER,
    MIN_TICK_TIME,
};
use crate::velocity::{calc_velocity, RequestedMove, SolveContext};

/// Surfaces steeper than this (by normal Y) count as fully vertical when
/// deciding whether to discard air control on a second impact.
const VERTICAL_SLOPE_NORMAL_Y: f32 = 0.001;

/// Result of one tick of falling simulation. Every variant is normal
/// control flow; none is a fault.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FallingOutcome {
    /// Tick time exhausted or the iteration cap was reached.
    Completed,
    /// A walkable surface was reached; the landing handler received the
    /// leftover time and final impact.
    Landed {
        leftover_time: f32,
        impact: ImpactRecord,
    },
    /// Simulation data became invalid mid-step (entity gone, mode changed).
    Aborted,
}

/// Engine services consumed while falling. Implementors own the collision
/// world and the surrounding movement state machine; the stepper only sees
/// these narrow capabilities.
pub trait FallingEnvironment {
    /// Performs a collision-aware move by `delta`, advancing
    /// `state.position` up to the first blocking contact, and reports it.
    fn sweep_move(&mut self, state: &mut KinematicState, delta: Vec3) -> ImpactRecord;

    /// Whether the contact at the current position may be treated as ground.
    fn is_valid_landing_spot(&mut self, state: &KinematicState, impact: &ImpactRecord) -> bool;

    /// Landing hand-off. Transitions the external state machine away from
    /// falling; receives the unconsumed tick time.
    fn on_landed(&mut self, impact: &ImpactRecord, leftover_time: f32, iterations: u32);

    /// Secondary floor probe for contacts the primary test rejected. A
    /// returned impact is treated as a confirmed landing.
    fn fallback_landing(
        &mut self,
        _state: &KinematicState,
        _delta: Vec3,
        _impact: &ImpactRecord,
    ) -> Option<ImpactRecord> {
        None
    }

    /// Bounds the air-control acceleration after a blocked move, so wall
    /// contact cannot be cancelled by unlimited lateral correction.
    fn limit_air_control(
        &mut self,
        _delta_time: f32,
        air_control_accel: Vec3,
        _impact: &ImpactRecord,
    ) -> Vec3 {
        air_control_accel
    }

    /// Notification of a blocking impact, before deflection.
    fn handle_impact(&mut self, _impact: &ImpactRecord, _time_slice: f32, _move_delta: Vec3) {}

    /// Edge-triggered notification that the jump apex was passed.
    fn on_jump_apex(&mut self) {}

    /// Whether the entity still has valid simulation data.
    fn is_valid(&self) -> bool {
        true
    }

    /// Whether the external state machine still considers the entity to be
    /// falling. Checked again after impact handling, which may change mode.
    fn is_falling(&self) -> bool {
        true
    }

    /// Whether this entity is locally authoritative. Remote proxies are
    /// never simulated here.
    fn is_authoritative(&self) -> bool {
        true
    }

    /// An animation-driven velocity override is active this tick.
    fn has_root_motion_override(&self) -> bool {
        false
    }

    /// A jump was just requested and is currently allowed.
    fn jump_primed(&self) -> bool {
        false
    }

    /// Path-following movement request, valid for one solver call.
    fn requested_move(&mut self, _delta_time: f32) -> Option<RequestedMove> {
        None
    }
}

/// Per-character falling bookkeeping: the pending apex notification and the
/// random source for the perch escape nudge.
#[derive(Component)]
pub struct FallingStepper {
    notify_apex: bool,
    rng: SmallRng,
}

impl Default for FallingStepper {
    fn default() -> Self {
        Self {
            notify_apex: false,
            rng: SmallRng::from_os_rng(),
        }
    }
}

impl FallingStepper {
    /// Deterministic stepper for tests and replays.
    pub fn seeded(seed: u64) -> Self {
        Self {
            notify_apex: false,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Arms the one-shot apex notification, typically on jump start. It
    /// fires when vertical velocity next crosses to non-positive.
    pub fn arm_apex_notification(&mut self) {
        self.notify_apex = true;
    }

    /// Simulates one tick of falling movement.
    ///
    /// Subdivides `delta_time` into bounded sub-steps; each sub-step
    /// integrates velocity, performs a swept move, and deflects the
    /// remaining motion off non-walkable contacts. Returns as soon as the
    /// character lands, the tick budget runs out, or the simulation data
    /// becomes invalid.
    pub fn phys_falling(
        &mut self,
        state: &mut KinematicState,
        config: &MovementConfig,
        env: &mut impl FallingEnvironment,
        delta_time: f32,
    ) -> FallingOutcome {
        if !env.is_valid() || !env.is_authoritative() {
            return FallingOutcome::Aborted;
        }
        if delta_time < MIN_TICK_TIME {
            return FallingOutcome::Completed;
        }

        // Only the horizontal part of the input drives lateral air movement;
        // gravity owns the vertical axis.
        let fall_acceleration = horizontal(state.acceleration);
        let has_air_control = fall_acceleration.length_squared() > 0.0;
        let gravity = Vec3::new(0.0, config.gravity, 0.0);

        let mut budget = TickBudget::new(delta_time);

        while budget.has_time(config.max_simulation_iterations) {
            let time_tick = budget.sub_step(
                config.max_simulation_time_step,
                config.max_simulation_iterations,
            );
            let old_location = state.position;
            let old_velocity = state.velocity;
            let root_motion = env.has_root_motion_override();

            // Integrating: lateral solve, then gravity on the vertical axis.
            // A parallel no-air-control velocity bounds how much air control
            // may alter a deflected trajectory later.
            let mut velocity_no_air = state.velocity;
            if !root_motion {
                if has_air_control {
                    // Find velocity *without* acceleration.
                    let mut scratch = *state;
                    scratch.acceleration = Vec3::ZERO;
                    scratch.velocity.y = 0.0;
                    let mut ctx = self.solve_context(env);
                    calc_velocity(
                        &mut scratch,
                        config,
                        &mut ctx,
                        time_tick,
                        config.falling_lateral_friction,
                        false,
                        config.braking_deceleration_falling,
                    );
                    velocity_no_air =
                        Vec3::new(scratch.velocity.x, old_velocity.y, scratch.velocity.z);
                }

                let input_acceleration = state.acceleration;
                state.acceleration = fall_acceleration;
                state.velocity.y = 0.0;
                let mut ctx = self.solve_context(env);
                ctx.requested_move = env.requested_move(time_tick);
                calc_velocity(
                    state,
                    config,
                    &mut ctx,
                    time_tick,
                    config.falling_lateral_friction,
                    false,
                    config.braking_deceleration_falling,
                );
                state.velocity.y = old_velocity.y;
                state.acceleration = input_acceleration;

                if !has_air_control {
                    velocity_no_air = state.velocity;
                }
            }

            state.velocity += gravity * time_tick;
            velocity_no_air += gravity * time_tick;
            let air_control_accel = (state.velocity - velocity_no_air) / time_tick;

            if self.notify_apex && state.velocity.y <= 0.0 {
                // Just passed the apex, heading down now.
                self.notify_apex = false;
                env.on_jump_apex();
            }

            // Moved: sweep along the average of pre- and post-integration
            // velocity for second-order accuracy.
            let mut adjusted = 0.5 * (old_velocity + state.velocity) * time_tick;
            let impact = env.sweep_move(state, adjusted);

            if !env.is_valid() {
                return FallingOutcome::Aborted;
            }

            let mut last_move_time_slice = time_tick;
            let mut sub_time_remaining = time_tick * (1.0 - impact.fraction);

            if impact.blocking {
                if env.is_valid_landing_spot(state, &impact) {
                    return self.land(env, &mut budget, sub_time_remaining, impact);
                }

                // Deflecting. Recompute the displacement from the actual
                // velocity so the full gravity effect is in the slide result.
                adjusted = state.velocity * time_tick;

                // A rejected contact may still sit over usable floor.
                if !impact.start_penetrating {
                    if let Some(floor) = env.fallback_landing(state, adjusted, &impact) {
                        return self.land(env, &mut budget, sub_time_remaining, floor);
                    }
                }

                env.handle_impact(&impact, last_move_time_slice, adjusted);
                if !env.is_valid() || !env.is_falling() {
                    return FallingOutcome::Aborted;
                }

                // We reached the impact point using air control, but deflect
                // from there with a bounded correction only.
                if has_air_control {
                    let air_delta_v = env.limit_air_control(
                        last_move_time_slice,
                        air_control_accel,
                        &impact,
                    ) * last_move_time_slice;
                    adjusted = (velocity_no_air + air_delta_v) * last_move_time_slice;
                }

                let old_hit_normal = impact.normal;
                let old_hit_impact_normal = impact.impact_normal;
                let mut delta = compute_slide_vector(adjusted, 1.0 - impact.fraction, old_hit_normal);

                if sub_time_remaining > KINDA_SMALL_NUMBER {
                    self.rederive_velocity(state, delta, sub_time_remaining, root_motion);
                }

                if sub_time_remaining > KINDA_SMALL_NUMBER && delta.dot(adjusted) > 0.0 {
                    // Move in the deflected direction.
                    let second = env.sweep_move(state, delta);

                    if second.blocking {
                        last_move_time_slice = sub_time_remaining;
                        sub_time_remaining *= 1.0 - second.fraction;

                        if env.is_valid_landing_spot(state, &second) {
                            return self.land(env, &mut budget, sub_time_remaining, second);
                        }

                        env.handle_impact(&second, last_move_time_slice, delta);
                        if !env.is_valid() || !env.is_falling() {
                            return FallingOutcome::Aborted;
                        }

                        // Act as if there was no air control on the last move
                        // when computing the new deflection off a steep wall.
                        if has_air_control && second.normal.y > VERTICAL_SLOPE_NORMAL_Y {
                            let last_move_no_air = velocity_no_air * last_move_time_slice;
                            delta = compute_slide_vector(last_move_no_air, 1.0, old_hit_normal);
                        }

                        two_wall_adjust(&mut delta, &second, old_hit_normal);

                        // Allow a bounded slide along the second wall, but
                        // never back into the first.
                        if has_air_control {
                            let air_delta_v = env.limit_air_control(
                                sub_time_remaining,
                                air_control_accel,
                                &second,
                            ) * sub_time_remaining;
                            if air_delta_v.dot(old_hit_normal) > 0.0 {
                                delta += air_delta_v * sub_time_remaining;
                            }
                        }

                        if sub_time_remaining > KINDA_SMALL_NUMBER {
                            self.rederive_velocity(state, delta, sub_time_remaining, root_motion);
                        }

                        // Straddling two slopes, neither of which the
                        // character can stand on.
                        let ditch = old_hit_impact_normal.y > 0.0
                            && second.impact_normal.y > 0.0
                            && delta.y.abs() <= KINDA_SMALL_NUMBER
                            && second.impact_normal.dot(old_hit_impact_normal) < 0.0;

                        let mut probe = env.sweep_move(state, delta);
                        if probe.fraction == 0.0 {
                            // Stuck; try to side step.
                            let mut side_delta =
                                horizontal(old_hit_normal + probe.impact_normal).normalize_or_zero();
                            if side_delta == Vec3::ZERO {
                                side_delta = Vec3::new(old_hit_normal.z, 0.0, -old_hit_normal.x)
                                    .normalize_or_zero();
                            }
                            probe = env.sweep_move(state, side_delta);
                        }

                        if ditch || env.is_valid_landing_spot(state, &probe) || probe.fraction == 0.0
                        {
                            if ditch {
                                debug!("wedged between non-walkable slopes, forcing landing");
                            }
                            budget.exhaust();
                            return self.land(env, &mut budget, 0.0, probe);
                        } else if config.perch_radius > 0.0
                            && probe.fraction == 1.0
                            && old_hit_impact_normal.y >= config.walkable_floor_y
                        {
                            // Possibly wedged in a virtual ditch within the
                            // perch radius. Rare; nudge out and retry.
                            let moved_up = (state.position.y - old_location.y).abs();
                            let moved_laterally_sq =
                                horizontal(state.position - old_location).length_squared();
                            if moved_up <= config.perch_height_tolerance * time_tick
                                && moved_laterally_sq <= config.perch_distance_tolerance * time_tick
                            {
                                let nudge = config.perch_nudge_scale * config.max_speed;
                                state.velocity.x += nudge * (self.rng.random::<f32>() - 0.5);
                                state.velocity.z += nudge * (self.rng.random::<f32>() - 0.5);
                                state.velocity.y =
                                    (config.jump_velocity * config.perch_nudge_scale).max(1.0);
                                let retry = state.velocity * time_tick;
                                let _ = env.sweep_move(state, retry);
                            }
                        }
                    }
                }
            }

            // Kill residual horizontal creep so deflections settle instead
            // of jittering forever.
            if horizontal(state.velocity).length_squared() <= KINDA_SMALL_NUMBER * 10.0 {
                state.velocity.x = 0.0;
                state.velocity.z = 0.0;
            }
        }

        FallingOutcome::Completed
    }

    fn solve_context<'a>(&self, env: &impl FallingEnvironment) -> SolveContext<'a> {
        let mut ctx = SolveContext::new(MovementMode::Falling);
        ctx.authoritative = env.is_authoritative();
        ctx.root_motion_override = env.has_root_motion_override();
        ctx.jump_primed = env.jump_primed();
        ctx
    }

    fn land(
        &mut self,
        env: &mut impl FallingEnvironment,
        budget: &mut TickBudget,
        unused_slice: f32,
        impact: ImpactRecord,
    ) -> FallingOutcome {
        budget.refund(unused_slice);
        let leftover_time = budget.remaining;
        env.on_landed(&impact, leftover_time, budget.iterations);
        FallingOutcome::Landed {
            leftover_time,
            impact,
        }
    }

    /// Re-derives velocity from a deflected displacement over the remaining
    /// slice time. With root motion active, only the vertical axis is taken
    /// from the deflection.
    fn rederive_velocity(
        &self,
        state: &mut KinematicState,
        delta: Vec3,
        sub_time_remaining: f32,
        root_motion: bool,
    ) {
        let new_velocity = delta / sub_time_remaining;
        state.velocity = if root_motion {
            Vec3::new(state.velocity.x, new_velocity.y, state.velocity.z)
        } else {
            new_velocity
        };
    }
}

/// Deflects the remaining displacement to slide along a blocking surface.
pub fn compute_slide_vector(delta: Vec3, time: f32, normal: Vec3) -> Vec3 {
    (delta - normal * delta.dot(normal)) * time
}

/// Adjusts a displacement that hit a second wall while sliding along a
/// first. Sharp corners redirect along the crease between both surfaces;
/// shallow ones slide along the new wall, with a tiny push-off when the
/// same wall was hit twice due to precision loss.
pub fn two_wall_adjust(delta: &mut Vec3, hit: &ImpactRecord, old_hit_normal: Vec3) {
    let hit_normal = hit.normal;

    if old_hit_normal.dot(hit_normal) <= 0.0 {
        // Corner of 90 degrees or less: move along the crease.
        let desired_dir = *delta;
        let crease = hit_normal.cross(old_hit_normal).normalize_or_zero();
        *delta = delta.dot(crease) * (1.0 - hit.fraction) * crease;
        if desired_dir.dot(*delta) < 0.0 {
            *delta = -*delta;
        }
    } else {
        let desired_dir = *delta;
        *delta = compute_slide_vector(*delta, 1.0 - hit.fraction, hit_normal);
        if delta.dot(desired_dir) <= 0.0 {
            *delta = Vec3::ZERO;
        } else if (hit_normal.dot(old_hit_normal) - 1.0).abs() < KINDA_SMALL_NUMBER {
            // Hit the same wall again even after adjusting to move along
            // it; nudge away from it.
            *delta += hit_normal * 0.01;
        }
    }
}
