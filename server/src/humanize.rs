//! # Mouse Humanization Engine
//!
//! Per-session generator of human-plausible mouse paths. Each session
//! owns a personality (motion biases sampled once at session creation)
//! and a cursor position; a movement request turns into a stream of
//! [`Waypoint`]s the extension replays with its input primitive.
//!
//! Paths are cubic Bezier arcs with both control points bowed to the same
//! side, sampled at irregular intervals, jittered per axis, and clamped to
//! the viewport. Long moves may overshoot the target and correct.

use bridge_protocol::Waypoint;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Median cursor velocity in px/s before personality scaling.
const MEDIAN_VELOCITY: f64 = 180.0;

/// Log-normal spread of the per-move velocity sample.
const VELOCITY_SIGMA: f64 = 0.4;

/// Moves shorter than this collapse to a single waypoint.
const SNAP_DISTANCE: f64 = 5.0;

/// Moves longer than this are overshoot candidates.
const OVERSHOOT_DISTANCE: f64 = 200.0;

/// Sampling interval bounds, ms.
const STEP_MIN_MS: f64 = 15.0;
const STEP_MAX_MS: f64 = 50.0;

/// Per-session motion biases. Sampled once, immutable for the session's
/// lifetime.
#[derive(Debug, Clone, Copy)]
pub struct Personality {
    /// Scales the sampled velocity.
    pub speed_multiplier: f64,
    /// Probability of overshooting on a long move.
    pub overshoot_tendency: f64,
    /// Bezier control-point offset as a fraction of arc length.
    pub curvature_bias: f64,
    /// Per-axis jitter magnitude in px.
    pub jitter_px: f64,
}

impl Personality {
    fn sample(rng: &mut StdRng) -> Self {
        Self {
            speed_multiplier: rng.gen_range(0.6..=1.6),
            overshoot_tendency: rng.gen_range(0.08..=0.35),
            curvature_bias: rng.gen_range(0.04..=0.18),
            jitter_px: rng.gen_range(0.4..=1.8),
        }
    }
}

/// Whether a move of length `distance` should overshoot, given the roll.
///
/// Exactly at the threshold there is no overshoot; strictly beyond it the
/// decision follows the personality's tendency.
pub fn should_overshoot(distance: f64, tendency: f64, roll: f64) -> bool {
    distance > OVERSHOOT_DISTANCE && roll < tendency
}

/// Humanization state for one session.
pub struct MouseSession {
    personality: Personality,
    cursor: (f64, f64),
    rng: StdRng,
}

impl MouseSession {
    /// Creates a session with a freshly sampled personality and the
    /// cursor at the viewport origin.
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Seeded constructor for deterministic tests.
    pub fn from_rng(mut rng: StdRng) -> Self {
        let personality = Personality::sample(&mut rng);
        Self {
            personality,
            cursor: (0.0, 0.0),
            rng,
        }
    }

    pub fn personality(&self) -> Personality {
        self.personality
    }

    pub fn cursor(&self) -> (f64, f64) {
        self.cursor
    }

    /// Plans a move to `(tx, ty)` inside `viewport` (width, height).
    ///
    /// The returned path always ends exactly on the clamped target, every
    /// waypoint lies inside the viewport, and the session cursor advances
    /// to the final waypoint.
    pub fn plan_move(&mut self, tx: f64, ty: f64, viewport: (u32, u32)) -> Vec<Waypoint> {
        let target = clamp_point(tx, ty, viewport);
        let (cx, cy) = self.cursor;
        let distance = ((target.0 - cx).powi(2) + (target.1 - cy).powi(2)).sqrt();

        if distance < SNAP_DISTANCE {
            let delay = self.rng.gen_range(STEP_MIN_MS..=STEP_MAX_MS) as u64;
            self.cursor = target;
            return vec![Waypoint {
                x: target.0,
                y: target.1,
                delay_ms: delay,
            }];
        }

        let velocity = self.sample_velocity();
        let duration_ms = (distance / velocity * 1000.0).max(50.0);

        let roll: f64 = self.rng.gen();
        let mut path = if should_overshoot(distance, self.personality.overshoot_tendency, roll) {
            let over = self.overshoot_point((cx, cy), target, distance, viewport);
            let mut first = self.bezier_arc((cx, cy), over, duration_ms * 0.7, viewport);
            let second = self.bezier_arc(over, target, duration_ms * 0.3, viewport);
            first.extend(second);
            first
        } else {
            self.bezier_arc((cx, cy), target, duration_ms, viewport)
        };

        // The tail of the path must land on the target itself, overriding
        // any jitter drift in the final sample.
        if let Some(last) = path.last_mut() {
            last.x = target.0;
            last.y = target.1;
        }

        self.cursor = target;
        path
    }

    /// One small idle movement 2–5 px from the cursor at a random angle.
    pub fn idle_drift(&mut self, viewport: (u32, u32)) -> Waypoint {
        let angle = self.rng.gen_range(0.0..std::f64::consts::TAU);
        let radius = self.rng.gen_range(2.0..=5.0);
        let (cx, cy) = self.cursor;
        let (x, y) = clamp_point(cx + radius * angle.cos(), cy + radius * angle.sin(), viewport);
        self.cursor = (x, y);
        Waypoint {
            x,
            y,
            delay_ms: self.rng.gen_range(STEP_MIN_MS..=STEP_MAX_MS) as u64,
        }
    }

    /// Cadence until the next idle drift while the session sits idle.
    pub fn drift_interval(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(10_000..=30_000))
    }

    /// Velocity for one move: `median × speed × exp(Z·σ)` with standard
    /// normal Z from the Box–Muller transform.
    fn sample_velocity(&mut self) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        let u2: f64 = self.rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
        MEDIAN_VELOCITY * self.personality.speed_multiplier * (z * VELOCITY_SIGMA).exp()
    }

    /// A point past the target along the movement vector, with a small
    /// perpendicular offset.
    fn overshoot_point(
        &mut self,
        from: (f64, f64),
        target: (f64, f64),
        distance: f64,
        viewport: (u32, u32),
    ) -> (f64, f64) {
        let (ux, uy) = ((target.0 - from.0) / distance, (target.1 - from.1) / distance);
        let reach = distance * self.rng.gen_range(0.05..=0.15);
        let side = distance * self.rng.gen_range(-0.03..=0.03);
        clamp_point(
            target.0 + ux * reach - uy * side,
            target.1 + uy * reach + ux * side,
            viewport,
        )
    }

    /// Samples one cubic Bezier arc at irregular intervals.
    fn bezier_arc(
        &mut self,
        from: (f64, f64),
        to: (f64, f64),
        duration_ms: f64,
        viewport: (u32, u32),
    ) -> Vec<Waypoint> {
        let dx = to.0 - from.0;
        let dy = to.1 - from.1;
        let length = (dx * dx + dy * dy).sqrt().max(1.0);
        let (px, py) = (-dy / length, dx / length);

        // Both control points bow to the same randomly chosen side.
        let side = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let bow = length * self.personality.curvature_bias * self.rng.gen_range(0.5..=1.0) * side;
        let c1 = (from.0 + dx * 0.33 + px * bow, from.1 + dy * 0.33 + py * bow);
        let c2 = (from.0 + dx * 0.66 + px * bow, from.1 + dy * 0.66 + py * bow);

        let mut path = Vec::new();
        let mut elapsed = 0.0;
        loop {
            let step = self.rng.gen_range(STEP_MIN_MS..=STEP_MAX_MS);
            elapsed += step;
            let done = elapsed >= duration_ms;
            let s = if done { 1.0 } else { elapsed / duration_ms };
            let (mut x, mut y) = cubic_bezier(from, c1, c2, to, s);
            if !done {
                x += self.rng.gen_range(-self.personality.jitter_px..=self.personality.jitter_px);
                y += self.rng.gen_range(-self.personality.jitter_px..=self.personality.jitter_px);
            }
            let (x, y) = clamp_point(x, y, viewport);
            path.push(Waypoint {
                x,
                y,
                delay_ms: step as u64,
            });
            if done {
                break;
            }
        }
        path
    }
}

impl Default for MouseSession {
    fn default() -> Self {
        Self::new()
    }
}

fn cubic_bezier(
    p0: (f64, f64),
    p1: (f64, f64),
    p2: (f64, f64),
    p3: (f64, f64),
    t: f64,
) -> (f64, f64) {
    let u = 1.0 - t;
    let (a, b, c, d) = (u * u * u, 3.0 * u * u * t, 3.0 * u * t * t, t * t * t);
    (
        a * p0.0 + b * p1.0 + c * p2.0 + d * p3.0,
        a * p0.1 + b * p1.1 + c * p2.1 + d * p3.1,
    )
}

fn clamp_point(x: f64, y: f64, viewport: (u32, u32)) -> (f64, f64) {
    (
        x.clamp(0.0, (viewport.0.saturating_sub(1)) as f64),
        y.clamp(0.0, (viewport.1.saturating_sub(1)) as f64),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> MouseSession {
        MouseSession::from_rng(StdRng::seed_from_u64(seed))
    }

    #[test]
    fn short_moves_emit_a_single_waypoint() {
        let mut session = seeded(1);
        let path = session.plan_move(3.0, 3.0, (1920, 1080));
        assert_eq!(path.len(), 1);
        assert_eq!((path[0].x, path[0].y), (3.0, 3.0));
        assert!((15..=50).contains(&path[0].delay_ms));
    }

    #[test]
    fn path_ends_exactly_on_target() {
        for seed in 0..20 {
            let mut session = seeded(seed);
            let path = session.plan_move(800.0, 600.0, (1920, 1080));
            let last = path.last().unwrap();
            assert_eq!((last.x, last.y), (800.0, 600.0), "seed {}", seed);
            assert_eq!(session.cursor(), (800.0, 600.0));
        }
    }

    #[test]
    fn waypoints_stay_inside_the_viewport() {
        // Target far outside the viewport, as in the clamping scenario:
        // every waypoint must fit and the path must end at (1919, 1079).
        for seed in 0..20 {
            let mut session = seeded(seed);
            session.plan_move(100.0, 100.0, (1920, 1080));
            let path = session.plan_move(5000.0, 5000.0, (1920, 1080));
            for wp in &path {
                assert!(wp.x >= 0.0 && wp.x <= 1919.0, "seed {} x={}", seed, wp.x);
                assert!(wp.y >= 0.0 && wp.y <= 1079.0, "seed {} y={}", seed, wp.y);
            }
            let last = path.last().unwrap();
            assert_eq!((last.x, last.y), (1919.0, 1079.0));
        }
    }

    #[test]
    fn delays_stay_within_sampling_bounds() {
        let mut session = seeded(7);
        let path = session.plan_move(1200.0, 300.0, (1920, 1080));
        for wp in &path {
            assert!((15..=50).contains(&wp.delay_ms), "delay {}", wp.delay_ms);
        }
    }

    #[test]
    fn overshoot_threshold_is_exclusive() {
        // Exactly at 200 px: never, even with a certain tendency.
        assert!(!should_overshoot(200.0, 1.0, 0.0));
        // Strictly past it: governed by the roll against the tendency.
        assert!(should_overshoot(201.0, 0.3, 0.29));
        assert!(!should_overshoot(201.0, 0.3, 0.31));
    }

    #[test]
    fn personality_fields_lie_in_their_ranges() {
        for seed in 0..50 {
            let p = seeded(seed).personality();
            assert!((0.6..=1.6).contains(&p.speed_multiplier));
            assert!((0.08..=0.35).contains(&p.overshoot_tendency));
            assert!((0.04..=0.18).contains(&p.curvature_bias));
            assert!((0.4..=1.8).contains(&p.jitter_px));
        }
    }

    #[test]
    fn idle_drift_moves_a_few_pixels() {
        let mut session = seeded(3);
        session.plan_move(500.0, 500.0, (1920, 1080));
        let before = session.cursor();
        let wp = session.idle_drift((1920, 1080));
        let d = ((wp.x - before.0).powi(2) + (wp.y - before.1).powi(2)).sqrt();
        assert!(d >= 2.0 && d <= 5.0, "drift distance {}", d);
        assert_eq!(session.cursor(), (wp.x, wp.y));
    }

    #[test]
    fn drift_interval_is_between_ten_and_thirty_seconds() {
        let mut session = seeded(9);
        for _ in 0..20 {
            let interval = session.drift_interval();
            assert!(interval >= Duration::from_secs(10));
            assert!(interval <= Duration::from_secs(30));
        }
    }
}
