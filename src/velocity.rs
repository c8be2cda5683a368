//! Velocity integration for one time slice: braking, turning friction,
//! fluid drag, and the air-strafe / ballistic accumulation branches.
//!
//! [`calc_velocity`] is a pure function of the passed-in state; it performs
//! no I/O and never leaves a non-finite velocity behind.

use bevy::prelude::*;
use tracing::trace;

use crate::config::MovementConfig;
use crate::kinematics::{
    horizontal, sanitize, KinematicState, MovementMode, KINDA_SMALL_NUMBER, MIN_TICK_TIME,
    SMALL_NUMBER,
};

/// Braking integrates in slices no longer than this so strong friction
/// cannot overshoot and flip the velocity sign within one frame.
const MAX_BRAKING_STEP: f32 = 1.0 / 33.0;

/// Below this speed, braking with nonzero deceleration snaps to a stop.
const BRAKE_TO_STOP_SPEED: f32 = 10.0;

/// Speeds may exceed the cap by 1% before counting as over-speed, to
/// absorb numeric imprecision.
const OVER_SPEED_TOLERANCE: f32 = 1.01;

/// Path-following movement request, valid for a single solver call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RequestedMove {
    pub acceleration: Vec3,
    pub speed: f32,
}

/// Per-call answers from the external collaborators the solver consults.
///
/// The avoidance hook post-processes the final velocity; the requested move
/// is consumed by the call it is given to.
pub struct SolveContext<'a> {
    pub mode: MovementMode,
    /// Only locally authoritative entities simulate; replicated proxies
    /// receive their velocity from elsewhere.
    pub authoritative: bool,
    /// An animation-driven velocity override is active this tick.
    pub root_motion_override: bool,
    /// A jump was just requested and is currently allowed; friction and
    /// braking are suppressed for this step so the jump frame keeps its
    /// momentum.
    pub jump_primed: bool,
    pub requested_move: Option<RequestedMove>,
    pub avoidance: Option<&'a mut dyn FnMut(Vec3, f32) -> Vec3>,
}

impl SolveContext<'_> {
    pub fn new(mode: MovementMode) -> Self {
        Self {
            mode,
            authoritative: true,
            root_motion_override: false,
            jump_primed: false,
            requested_move: None,
            avoidance: None,
        }
    }
}

/// Whether `velocity` exceeds `max_speed` beyond tolerance.
#[inline]
pub fn exceeds_max_speed(velocity: Vec3, max_speed: f32) -> bool {
    let max_speed = max_speed.max(0.0);
    velocity.length_squared() > max_speed * max_speed * OVER_SPEED_TOLERANCE
}

/// Computes the new velocity for one time slice.
///
/// `friction` is the contact friction for this slice (callers pass ground
/// friction while walking and `falling_lateral_friction` while airborne),
/// `fluid` applies fluid drag on top of whichever branch ran, and
/// `braking_deceleration` is the constant deceleration used when braking.
///
/// Leaves the velocity untouched for sub-minimum time slices, active
/// root-motion overrides, and non-authoritative entities.
pub fn calc_velocity(
    state: &mut KinematicState,
    config: &MovementConfig,
    ctx: &mut SolveContext,
    delta_time: f32,
    friction: f32,
    fluid: bool,
    braking_deceleration: f32,
) {
    if !ctx.authoritative || ctx.root_motion_override || delta_time < MIN_TICK_TIME {
        return;
    }

    let pre_solve_velocity = state.velocity;

    let (mut friction, mut braking_deceleration) = (friction, braking_deceleration);
    if ctx.jump_primed {
        friction = 0.0;
        braking_deceleration = 0.0;
    }
    let friction = friction.max(0.0);

    let max_accel = config.max_acceleration;

    // Path-following requested movement.
    let mut requested_acceleration = Vec3::ZERO;
    let mut requested_speed = 0.0;
    let mut zero_requested_acceleration = true;
    if let Some(requested) = ctx.requested_move.take() {
        requested_acceleration = requested.acceleration.clamp_length_max(max_accel);
        requested_speed = requested.speed;
        zero_requested_acceleration = false;
    }

    let mut analog_scale = config.analog_input_scale;
    if config.force_max_acceleration {
        // Force acceleration at full rate. In consideration order for
        // direction: acceleration, then velocity, then facing.
        if state.acceleration.length_squared() > SMALL_NUMBER {
            state.acceleration = state.acceleration.normalize() * max_accel;
        } else if state.velocity.length_squared() > SMALL_NUMBER {
            state.acceleration = state.velocity.normalize() * max_accel;
        } else {
            state.acceleration = state.forward() * max_accel;
        }
        analog_scale = 1.0;
    }

    // Path following above ignored the analog modifier; everything below
    // uses the fully modified value.
    let max_speed = requested_speed.max(config.max_speed * analog_scale);

    let zero_acceleration = state.acceleration == Vec3::ZERO;
    let velocity_over_max = exceeds_max_speed(state.velocity, max_speed);

    // Only brake when there is no acceleration, or we are over max speed
    // and need to slow down to it.
    if (zero_acceleration && zero_requested_acceleration) || velocity_over_max {
        let old_velocity = state.velocity;

        let braking_friction = if config.use_separate_braking_friction {
            config.braking_friction
        } else {
            friction
        };
        apply_velocity_braking(state, delta_time, braking_friction, braking_deceleration);

        // Don't allow braking to lower us below max speed if we started
        // above it and are still pushing the same way.
        if velocity_over_max
            && state.velocity.length_squared() < max_speed * max_speed
            && state.acceleration.dot(old_velocity) > 0.0
        {
            state.velocity = old_velocity.normalize_or_zero() * max_speed;
        }
    } else if !zero_acceleration {
        // Friction affects our ability to change direction. Input
        // acceleration only, not path following.
        let accel_dir = state.acceleration.normalize_or_zero();
        let speed = state.velocity.length();
        state.velocity -= (state.velocity - accel_dir * speed) * (delta_time * friction).min(1.0);
    }

    // Fluid drag applies regardless of which branch ran.
    if fluid {
        state.velocity *= 1.0 - (friction * delta_time).min(1.0);
    }

    if config.air_strafe_enabled && ctx.mode == MovementMode::Falling {
        // Acceleration contributes least when aligned with travel and most
        // when perpendicular or opposed: changing direction gains speed.
        let velocity_dir = horizontal(state.velocity).normalize_or_zero();
        let accel_dir = horizontal(state.acceleration).normalize_or_zero();
        let dot = velocity_dir.dot(accel_dir);
        trace!(dot, "air strafe alignment");

        let old_horizontal_speed = horizontal(state.velocity).length();
        state.velocity +=
            config.strafing_multiplier * state.acceleration * (1.0 - dot).max(0.5) * delta_time;

        let horizontal_speed = horizontal(state.velocity).length();
        if horizontal_speed > old_horizontal_speed {
            // The renormalization itself must not cost speed; floor the
            // result at the configured minimum.
            state.velocity = state.velocity.normalize_or_zero()
                * horizontal_speed.max(config.strafe_speed_floor);
        }
    } else {
        // Default ballistic accumulation.
        let speed_cap = if exceeds_max_speed(state.velocity, max_speed) {
            state.velocity.length()
        } else {
            max_speed
        };
        state.velocity += state.acceleration * delta_time;
        state.velocity += requested_acceleration * delta_time;
        state.velocity = state.velocity.clamp_length_max(speed_cap);
    }

    if let Some(avoidance) = ctx.avoidance.as_mut() {
        state.velocity = avoidance(state.velocity, delta_time);
    }

    state.velocity = sanitize(state.velocity, pre_solve_velocity);
}

/// Decays velocity toward zero over `delta_time` using friction and a
/// constant reverse deceleration.
///
/// Integration runs in bounded internal slices and stops dead when the
/// velocity would reverse against its starting direction, so decay is
/// monotone and never oscillates in sign.
pub fn apply_velocity_braking(
    state: &mut KinematicState,
    delta_time: f32,
    friction: f32,
    braking_deceleration: f32,
) {
    if state.velocity == Vec3::ZERO || delta_time < MIN_TICK_TIME {
        return;
    }

    let friction = friction.max(0.0);
    let braking_deceleration = braking_deceleration.max(0.0);
    let zero_friction = friction == 0.0;
    let zero_braking = braking_deceleration == 0.0;
    if zero_friction && zero_braking {
        return;
    }

    let old_velocity = state.velocity;
    let reverse_accel = if zero_braking {
        Vec3::ZERO
    } else {
        -braking_deceleration * state.velocity.normalize()
    };

    let mut remaining = delta_time;
    while remaining >= MIN_TICK_TIME {
        let dt = if remaining > MAX_BRAKING_STEP && !zero_friction {
            (remaining * 0.5).min(MAX_BRAKING_STEP)
        } else {
            remaining
        };
        remaining -= dt;

        state.velocity += (-friction * state.velocity + reverse_accel) * dt;

        // Don't reverse direction.
        if state.velocity.dot(old_velocity) <= 0.0 {
            state.velocity = Vec3::ZERO;
            return;
        }
    }

    // Snap to a stop when nearly stationary.
    let speed_sq = state.velocity.length_squared();
    if speed_sq <= KINDA_SMALL_NUMBER
        || (!zero_braking && speed_sq <= BRAKE_TO_STOP_SPEED * BRAKE_TO_STOP_SPEED)
    {
        state.velocity = Vec3::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state_with_velocity(velocity: Vec3) -> KinematicState {
        KinematicState {
            velocity,
            ..default()
        }
    }

    #[test]
    fn sub_minimum_tick_is_a_no_op() {
        let mut state = state_with_velocity(Vec3::new(100.0, 0.0, 0.0));
        let config = MovementConfig::default();
        let mut ctx = SolveContext::new(MovementMode::Falling);
        calc_velocity(&mut state, &config, &mut ctx, 1e-8, 8.0, false, 0.0);
        assert_eq!(state.velocity, Vec3::new(100.0, 0.0, 0.0));
    }

    #[test]
    fn remote_proxies_do_not_simulate() {
        let mut state = state_with_velocity(Vec3::new(100.0, 0.0, 0.0));
        state.acceleration = Vec3::new(0.0, 0.0, 500.0);
        let config = MovementConfig::default();
        let mut ctx = SolveContext::new(MovementMode::Falling);
        ctx.authoritative = false;
        calc_velocity(&mut state, &config, &mut ctx, 0.016, 8.0, false, 0.0);
        assert_eq!(state.velocity, Vec3::new(100.0, 0.0, 0.0));
    }

    #[test]
    fn root_motion_override_skips_the_solver() {
        let mut state = state_with_velocity(Vec3::new(100.0, 0.0, 0.0));
        let config = MovementConfig::default();
        let mut ctx = SolveContext::new(MovementMode::Walking);
        ctx.root_motion_override = true;
        calc_velocity(&mut state, &config, &mut ctx, 0.016, 8.0, false, 2048.0);
        assert_eq!(state.velocity, Vec3::new(100.0, 0.0, 0.0));
    }

    #[test]
    fn braking_decays_monotonically_to_zero() {
        let mut state = state_with_velocity(Vec3::new(400.0, 0.0, 300.0));
        let start_dir = state.velocity.normalize();
        let mut last_speed = state.velocity.length();
        for _ in 0..200 {
            apply_velocity_braking(&mut state, 0.016, 8.0, 2048.0);
            let speed = state.velocity.length();
            assert!(speed <= last_speed + 1e-3, "speed increased while braking");
            // Never flips sign against the original direction.
            assert!(state.velocity.dot(start_dir) >= 0.0);
            last_speed = speed;
        }
        assert_eq!(state.velocity, Vec3::ZERO);
    }

    #[test]
    fn braking_handles_one_large_step() {
        let mut state = state_with_velocity(Vec3::new(1000.0, 0.0, 0.0));
        // A half-second at high friction in a single call; the internal
        // slicing keeps this from overshooting into the opposite direction.
        apply_velocity_braking(&mut state, 0.5, 8.0, 2048.0);
        assert!(state.velocity.x >= 0.0);
    }

    #[test]
    fn overspeed_snapback_keeps_max_speed() {
        // Over-speed and still pushing the same way: braking may not drop
        // us below max speed.
        let mut state = state_with_velocity(Vec3::new(1000.0, 0.0, 0.0));
        state.acceleration = Vec3::new(2048.0, 0.0, 0.0);
        let config = MovementConfig::default();
        let mut ctx = SolveContext::new(MovementMode::Walking);
        calc_velocity(&mut state, &config, &mut ctx, 0.01, 8.0, false, 100_000.0);
        assert!(
            state.velocity.length() >= 600.0 - 1e-3,
            "snap-back failed: {}",
            state.velocity.length()
        );
    }

    #[test]
    fn perpendicular_strafe_gains_speed() {
        let mut state = state_with_velocity(Vec3::new(500.0, 0.0, 0.0));
        state.acceleration = Vec3::new(0.0, 0.0, 500.0);
        let config = MovementConfig::default();
        let mut ctx = SolveContext::new(MovementMode::Falling);
        calc_velocity(&mut state, &config, &mut ctx, 0.02, 0.0, false, 0.0);
        assert!(
            state.horizontal_speed() > 500.0,
            "perpendicular input must increase speed, got {}",
            state.horizontal_speed()
        );
    }

    #[test]
    fn aligned_strafe_contributes_half_of_perpendicular() {
        // The dot-based factor floors at 0.5: input aligned with travel
        // contributes exactly half the acceleration of perpendicular input.
        let config = MovementConfig::default();

        let mut perp = state_with_velocity(Vec3::new(500.0, 0.0, 0.0));
        perp.acceleration = Vec3::new(0.0, 0.0, 500.0);
        let mut ctx = SolveContext::new(MovementMode::Falling);
        calc_velocity(&mut perp, &config, &mut ctx, 0.02, 0.0, false, 0.0);
        let perp_contribution = (perp.velocity - Vec3::new(500.0, 0.0, 0.0)).length();

        let mut para = state_with_velocity(Vec3::new(500.0, 0.0, 0.0));
        para.acceleration = Vec3::new(500.0, 0.0, 0.0);
        let mut ctx = SolveContext::new(MovementMode::Falling);
        calc_velocity(&mut para, &config, &mut ctx, 0.02, 0.0, false, 0.0);
        let para_contribution = (para.velocity - Vec3::new(500.0, 0.0, 0.0)).length();

        assert!(perp_contribution > 0.0 && para_contribution > 0.0);
        assert!(
            (para_contribution - perp_contribution * 0.5).abs() < 1e-2,
            "aligned contribution {para_contribution} should be half of {perp_contribution}"
        );
    }

    #[test]
    fn strafe_floor_applies_from_near_standstill() {
        // Any strafe gain from (near) rest gets floored at the minimum
        // post-strafe speed.
        let mut state = state_with_velocity(Vec3::ZERO);
        state.acceleration = Vec3::new(10.0, 0.0, 0.0);
        let config = MovementConfig::default();
        let mut ctx = SolveContext::new(MovementMode::Falling);
        calc_velocity(&mut state, &config, &mut ctx, 0.02, 0.0, false, 0.0);
        assert!(state.velocity.length() >= config.strafe_speed_floor - 1e-4);
    }

    #[test]
    fn fluid_drag_is_monotone_and_hits_zero() {
        let config = MovementConfig {
            // Keep braking inert so the drag term is isolated.
            use_separate_braking_friction: true,
            braking_friction: 0.0,
            air_strafe_enabled: false,
            ..default()
        };

        let mut last_speed = f32::INFINITY;
        for dt in [0.02, 0.05, 0.08, 0.1] {
            let mut state = state_with_velocity(Vec3::new(200.0, 0.0, 0.0));
            let mut ctx = SolveContext::new(MovementMode::Swimming);
            calc_velocity(&mut state, &config, &mut ctx, dt, 8.0, true, 0.0);
            let speed = state.velocity.length();
            assert!(speed < last_speed);
            last_speed = speed;
        }

        // friction * dt >= 1 kills the velocity outright.
        let mut state = state_with_velocity(Vec3::new(200.0, 0.0, 0.0));
        let mut ctx = SolveContext::new(MovementMode::Swimming);
        calc_velocity(&mut state, &config, &mut ctx, 0.2, 8.0, true, 0.0);
        assert_eq!(state.velocity, Vec3::ZERO);
    }

    #[test]
    fn ballistic_branch_clamps_to_max_speed() {
        let mut state = state_with_velocity(Vec3::new(590.0, 0.0, 0.0));
        state.acceleration = Vec3::new(2048.0, 0.0, 0.0);
        let config = MovementConfig {
            air_strafe_enabled: false,
            ..default()
        };
        let mut ctx = SolveContext::new(MovementMode::Falling);
        calc_velocity(&mut state, &config, &mut ctx, 0.1, 0.0, false, 0.0);
        assert!(state.velocity.length() <= 600.0 + 1e-3);
    }

    #[test]
    fn force_max_acceleration_rederives_direction() {
        let config = MovementConfig {
            force_max_acceleration: true,
            air_strafe_enabled: false,
            ..default()
        };

        // No input, moving: direction comes from velocity.
        let mut state = state_with_velocity(Vec3::new(0.0, 0.0, -100.0));
        let mut ctx = SolveContext::new(MovementMode::Walking);
        calc_velocity(&mut state, &config, &mut ctx, 0.016, 8.0, false, 0.0);
        assert!(state.acceleration.abs_diff_eq(Vec3::NEG_Z * 2048.0, 1e-2));

        // No input, stationary: direction comes from the heading.
        let mut state = KinematicState::default();
        let mut ctx = SolveContext::new(MovementMode::Walking);
        calc_velocity(&mut state, &config, &mut ctx, 0.016, 8.0, false, 0.0);
        assert!(state.acceleration.abs_diff_eq(Vec3::NEG_Z * 2048.0, 1e-2));
    }

    #[test]
    fn requested_move_raises_max_speed_and_is_consumed() {
        let mut state = KinematicState::default();
        let config = MovementConfig {
            air_strafe_enabled: false,
            ..default()
        };
        let mut ctx = SolveContext::new(MovementMode::Walking);
        ctx.requested_move = Some(RequestedMove {
            acceleration: Vec3::new(4096.0, 0.0, 0.0),
            speed: 900.0,
        });
        calc_velocity(&mut state, &config, &mut ctx, 0.5, 8.0, false, 0.0);
        assert!(ctx.requested_move.is_none());
        // Requested acceleration is clamped to max acceleration, and the
        // speed hint raises the cap above the configured max speed.
        assert!(state.velocity.length() > 600.0);
        assert!(state.velocity.length() <= 900.0 + 1e-3);
    }

    #[test]
    fn jump_primed_suppresses_braking() {
        let mut state = state_with_velocity(Vec3::new(400.0, 0.0, 0.0));
        let config = MovementConfig::default();
        let mut ctx = SolveContext::new(MovementMode::Walking);
        ctx.jump_primed = true;
        calc_velocity(&mut state, &config, &mut ctx, 0.016, 8.0, false, 2048.0);
        assert_eq!(state.velocity, Vec3::new(400.0, 0.0, 0.0));
    }

    #[test]
    fn avoidance_postprocesses_velocity() {
        let mut state = state_with_velocity(Vec3::new(100.0, 0.0, 0.0));
        state.acceleration = Vec3::new(100.0, 0.0, 0.0);
        let config = MovementConfig {
            air_strafe_enabled: false,
            ..default()
        };
        let mut correction = |velocity: Vec3, _dt: f32| velocity + Vec3::new(0.0, 0.0, 25.0);
        let mut ctx = SolveContext::new(MovementMode::Walking);
        ctx.avoidance = Some(&mut correction);
        calc_velocity(&mut state, &config, &mut ctx, 0.016, 8.0, false, 0.0);
        assert!((state.velocity.z - 25.0).abs() < 1e-4);
    }

    proptest! {
        #[test]
        fn output_velocity_is_always_finite(
            vx in -2000.0f32..2000.0, vy in -2000.0f32..2000.0, vz in -2000.0f32..2000.0,
            ax in -4096.0f32..4096.0, ay in -4096.0f32..4096.0, az in -4096.0f32..4096.0,
            friction in 0.0f32..64.0,
            braking in 0.0f32..8192.0,
            dt in 1e-5f32..0.1,
            fluid in proptest::bool::ANY,
            strafe in proptest::bool::ANY,
        ) {
            let mut state = KinematicState {
                velocity: Vec3::new(vx, vy, vz),
                acceleration: Vec3::new(ax, ay, az),
                ..default()
            };
            let config = MovementConfig {
                air_strafe_enabled: strafe,
                ..default()
            };
            let mut ctx = SolveContext::new(MovementMode::Falling);
            calc_velocity(&mut state, &config, &mut ctx, dt, friction, fluid, braking);
            prop_assert!(state.velocity.is_finite(), "non-finite velocity: {:?}", state.velocity);
        }

        #[test]
        fn braking_never_reverses_direction(
            vx in -2000.0f32..2000.0, vz in -2000.0f32..2000.0,
            friction in 0.0f32..64.0,
            braking in 0.0f32..8192.0,
            dt in 1e-4f32..0.5,
        ) {
            let start = Vec3::new(vx, 0.0, vz);
            let mut state = state_with_velocity(start);
            apply_velocity_braking(&mut state, dt, friction, braking);
            prop_assert!(state.velocity.dot(start) >= 0.0);
            prop_assert!(state.velocity.length() <= start.length() + 1e-2);
        }
    }
}
