//! Force-directed 3D layout over the selected subgraph.
//!
//! The graph arrives as an arena: node positions in one parallel array,
//! links as index pairs into it. Integration is semi-implicit Euler with
//! velocity damping, a velocity clamp, and a position clamp to a bounding
//! box. The simulation stops when the fastest node drops below the stop
//! epsilon or the iteration budget runs out.

use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Shell radius scale for initial placement.
const SHELL_SCALE: f64 = 10.0;
/// Repulsion strength before crowd attenuation.
const REPULSION: f64 = 50.0;
/// Cap on any single pairwise repulsion contribution.
const REPULSION_CAP: f64 = 25.0;
/// Spring constant for link attraction.
const SPRING: f64 = 0.02;
/// Rest length of a link spring.
const REST_LENGTH: f64 = 30.0;
/// Pull toward the origin, keeping disconnected fragments in frame.
const CENTERING: f64 = 0.005;
/// Velocity damping per step.
const DAMPING: f64 = 0.85;
/// Velocity clamp.
const V_MAX: f64 = 15.0;
/// Position clamp, per axis.
const R_MAX: f64 = 3_000.0;
/// Distance floor preventing singular repulsion.
const MIN_DISTANCE: f64 = 0.01;
/// Convergence threshold on the fastest node's speed.
const EPSILON_STOP: f64 = 0.05;

/// Layout tunables resolved from configuration.
#[derive(Debug, Clone, Copy)]
pub struct LayoutParams {
    /// Iteration budget when auto-tune is off.
    pub iterations: usize,
    /// Auto-tune: scale the budget and attenuate repulsion by crowd size.
    pub auto_tune: bool,
    /// Seed for the deterministic initial placement.
    pub seed: u64,
}

/// The finished simulation.
#[derive(Debug, Clone)]
pub struct LayoutResult {
    /// Final positions, parallel to the input nodes.
    pub positions: Vec<[f64; 3]>,
    /// Iterations actually run.
    pub iterations_run: usize,
    /// Whether the stop epsilon was reached inside the budget.
    pub converged: bool,
}

/// Runs the force simulation.
///
/// `seeds` carries any previously stored position per node (None places the
/// node on a fresh spherical shell). `links` are index pairs into `seeds`.
pub fn run_layout(seeds: &[Option<[f64; 3]>], links: &[(usize, usize)], params: &LayoutParams) -> LayoutResult {
    let n = seeds.len();
    if n == 0 {
        return LayoutResult {
            positions: Vec::new(),
            iterations_run: 0,
            converged: true,
        };
    }

    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
    let shell_radius = (n as f64).cbrt() * SHELL_SCALE;
    let mut positions: Vec<[f64; 3]> = seeds
        .iter()
        .map(|seed| seed.unwrap_or_else(|| random_shell_point(&mut rng, shell_radius)))
        .collect();
    let mut velocities = vec![[0.0f64; 3]; n];
    let mut forces = vec![[0.0f64; 3]; n];

    // Crowded graphs trade repulsion fidelity for run time.
    let attenuation = if params.auto_tune {
        (1_000.0 / n as f64).cbrt().min(1.0)
    } else {
        1.0
    };
    let repulsion = REPULSION * attenuation;
    let budget = if params.auto_tune {
        200.max(n / 100)
    } else {
        params.iterations
    };

    let mut iterations_run = 0;
    let mut converged = false;
    for _ in 0..budget {
        iterations_run += 1;
        for force in forces.iter_mut() {
            *force = [0.0; 3];
        }

        // Pairwise repulsion.
        for i in 0..n {
            for j in (i + 1)..n {
                let delta = sub(positions[i], positions[j]);
                let dist = norm(delta).max(MIN_DISTANCE);
                let magnitude = (repulsion / (dist * dist)).min(REPULSION_CAP);
                let push = scale(delta, magnitude / dist);
                forces[i] = add(forces[i], push);
                forces[j] = sub(forces[j], push);
            }
        }

        // Spring attraction along links.
        for &(a, b) in links {
            if a >= n || b >= n || a == b {
                continue;
            }
            let delta = sub(positions[b], positions[a]);
            let dist = norm(delta).max(MIN_DISTANCE);
            let stretch = dist - REST_LENGTH;
            let pull = scale(delta, SPRING * stretch / dist);
            forces[a] = add(forces[a], pull);
            forces[b] = sub(forces[b], pull);
        }

        // Centering pull.
        for i in 0..n {
            forces[i] = sub(forces[i], scale(positions[i], CENTERING));
        }

        // Semi-implicit Euler with damping and clamps.
        let mut max_speed = 0.0f64;
        for i in 0..n {
            let mut velocity = scale(add(velocities[i], forces[i]), DAMPING);
            let speed = norm(velocity);
            if speed > V_MAX {
                velocity = scale(velocity, V_MAX / speed);
            }
            velocities[i] = velocity;
            let mut position = add(positions[i], velocity);
            for axis in &mut position {
                *axis = axis.clamp(-R_MAX, R_MAX);
            }
            positions[i] = position;
            max_speed = max_speed.max(norm(velocities[i]));
        }

        if max_speed < EPSILON_STOP {
            converged = true;
            break;
        }
    }

    LayoutResult {
        positions,
        iterations_run,
        converged,
    }
}

fn random_shell_point(rng: &mut ChaCha8Rng, radius: f64) -> [f64; 3] {
    // Rejection-sample a direction to avoid pole clustering.
    loop {
        let x: f64 = rng.gen_range(-1.0..=1.0);
        let y: f64 = rng.gen_range(-1.0..=1.0);
        let z: f64 = rng.gen_range(-1.0..=1.0);
        let len = (x * x + y * y + z * z).sqrt();
        if len > 1e-6 && len <= 1.0 {
            return [x / len * radius, y / len * radius, z / len * radius];
        }
    }
}

fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn scale(a: [f64; 3], k: f64) -> [f64; 3] {
    [a[0] * k, a[1] * k, a[2] * k]
}

fn norm(a: [f64; 3]) -> f64 {
    (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt()
}

/// Euclidean displacement between two stored positions, for the epsilon
/// write filter.
pub fn displacement(old: Option<[f64; 3]>, new: [f64; 3]) -> f64 {
    match old {
        Some(old) => norm(sub(new, old)),
        None => f64::INFINITY,
    }
}
