//! Particle swarm engine, with the inertia weight of Shi and Eberhart
//! (10.1109/icec.1998.699146).
//!
//! Particles only ever move to positions where the model can be
//! evaluated: an invalid move halves the particle's velocity and tries
//! again, a bounded number of times.

use super::{EngineBase, EngineOptionSpec, EngineOptions, EngineState, FitEngine, IterationStatus};
use crate::error::{FitError, Result};
use crate::fit::FitContext;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Tries for a valid starting position, or a valid move.
const MAX_TRIES: usize = 20;

/// Relative improvement of the global best below which an iteration
/// counts as stalled.
const STALL_THRESHOLD: f64 = 1e-8;

#[derive(Debug, Clone)]
struct Particle {
    position: Array1<f64>,
    best: Array1<f64>,
    best_residuals: f64,
    velocity: Array1<f64>,
}

/// Option schema of the particle swarm engine.
pub fn pso_options() -> Vec<EngineOptionSpec> {
    vec![
        EngineOptionSpec::integer("particles", "Number of particles"),
        EngineOptionSpec::number("starting-inertia", "Starting inertial coefficient"),
        EngineOptionSpec::number("min-inertia", "Minimal inertial coefficient"),
        EngineOptionSpec::number("delta", "Decrease of the inertial coefficient per iteration"),
        EngineOptionSpec::number("velocity-scaling", "Scale of the initial velocities"),
        EngineOptionSpec::integer("seed", "Seed of the random generator"),
        EngineOptionSpec::integer("stall-iterations", "Iterations without progress before ending (0: never)"),
    ]
}

pub struct ParticleSwarmEngine {
    base: EngineBase,
    particles: Vec<Particle>,
    current_best: usize,
    /// Best position found so far.
    current: Array1<f64>,
    inertia: f64,
    stalled: usize,
    rng: StdRng,

    particle_number: usize,
    initial_inertia: f64,
    min_inertia: f64,
    delta: f64,
    velocity_scaling: f64,
    seed: Option<u64>,
    stall_iterations: usize,
}

/// Multiplies every component by a uniform random number in `[low, high)`.
fn randomize(v: &Array1<f64>, low: f64, high: f64, rng: &mut impl Rng) -> Array1<f64> {
    if low >= high {
        return v * low;
    }
    v.mapv(|x| x * rng.gen_range(low..high))
}

impl ParticleSwarmEngine {
    pub fn new(context: Arc<FitContext>) -> Self {
        Self {
            base: EngineBase::new(context),
            particles: Vec::new(),
            current_best: 0,
            current: Array1::zeros(0),
            inertia: 1.4,
            stalled: 0,
            rng: StdRng::from_entropy(),
            particle_number: 50,
            initial_inertia: 1.4,
            min_inertia: 0.6,
            delta: 0.08,
            velocity_scaling: 0.2,
            seed: None,
            stall_iterations: 30,
        }
    }

    /// Norm of the residuals at `position`, or `None` for invalid points.
    fn try_position(&self, position: &Array1<f64>) -> Result<Option<f64>> {
        match self.base.context.residual_norm(position) {
            Ok(r) => Ok(Some(r)),
            Err(e) if e.is_recoverable() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn best(&self) -> Option<&Particle> {
        self.particles.get(self.current_best)
    }

    fn step(&mut self) -> Result<IterationStatus> {
        let previous_best = self.best().map_or(f64::INFINITY, |p| p.best_residuals);

        for i in 0..self.particles.len() {
            let mut tries = MAX_TRIES;
            loop {
                let np = &self.particles[i].position + &self.particles[i].velocity;
                match self.try_position(&np)? {
                    Some(r) => {
                        let p = &mut self.particles[i];
                        p.position = np;
                        if r < p.best_residuals {
                            p.best = p.position.clone();
                            p.best_residuals = r;
                        }
                        break;
                    }
                    None => {
                        self.particles[i].velocity *= 0.5;
                        tries -= 1;
                        if tries == 0 {
                            return Err(FitError::Domain(format!(
                                "unable to find a suitable position for particle {}",
                                i
                            )));
                        }
                    }
                }
            }
            if self.particles[i].best_residuals < self.particles[self.current_best].best_residuals {
                self.current_best = i;
            }
        }

        let global = self.particles[self.current_best].best.clone();
        let inertia = self.inertia;
        for p in &mut self.particles {
            let dg = randomize(&(&global - &p.position), 0.0, 2.0, &mut self.rng);
            let dp = randomize(&(&p.best - &p.position), 0.0, 2.0, &mut self.rng);
            p.velocity = &p.velocity * inertia + dg + dp;
        }
        self.inertia = (self.inertia - self.delta).max(self.min_inertia);

        let best = self.particles[self.current_best].best_residuals;
        self.current = self.particles[self.current_best].best.clone();
        log::debug!(
            "pso iteration {}: best residuals {:e}, inertia {}",
            self.base.iterations,
            best,
            self.inertia
        );
        if self.stall_iterations == 0 {
            return Ok(IterationStatus::Continue);
        }
        if previous_best - best > STALL_THRESHOLD * previous_best.abs() {
            self.stalled = 0;
        } else {
            self.stalled += 1;
        }
        Ok(if self.stalled >= self.stall_iterations {
            IterationStatus::Success
        } else {
            IterationStatus::Continue
        })
    }
}

impl FitEngine for ParticleSwarmEngine {
    fn name(&self) -> &'static str {
        "pso"
    }

    fn initialize(&mut self, initial_guess: &[f64]) -> Result<()> {
        let params = self.base.pack(initial_guess)?;
        self.rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.particles.clear();
        self.current_best = 0;
        for i in 0..self.particle_number.max(1) {
            let mut tries = MAX_TRIES;
            let (position, residuals) = loop {
                let position = if i > 0 {
                    randomize(&params, 0.5, 2.0, &mut self.rng)
                } else {
                    params.clone()
                };
                if let Some(r) = self.try_position(&position)? {
                    break (position, r);
                }
                tries -= 1;
                if tries == 0 {
                    return Err(FitError::Domain(
                        "unable to find a starting position".to_string(),
                    ));
                }
            };
            let velocity = randomize(
                &position,
                -self.velocity_scaling,
                self.velocity_scaling,
                &mut self.rng,
            );
            self.particles.push(Particle {
                best: position.clone(),
                best_residuals: residuals,
                position,
                velocity,
            });
            if residuals < self.particles[self.current_best].best_residuals {
                self.current_best = i;
            }
        }
        self.current = self.particles[self.current_best].best.clone();
        self.inertia = self.initial_inertia;
        self.stalled = 0;
        self.base.initialized();
        Ok(())
    }

    fn iterate(&mut self) -> Result<IterationStatus> {
        self.base.begin_iteration()?;
        let outcome = self.step();
        self.base.finish_iteration(outcome)
    }

    fn current_parameters(&self) -> &Array1<f64> {
        &self.current
    }

    fn residuals(&self) -> f64 {
        self.best().map_or(f64::NAN, |p| p.best_residuals)
    }

    fn compute_covariance_matrix(&mut self) -> Result<Array2<f64>> {
        super::covariance_at(&self.base.context, &self.current)
    }

    fn state(&self) -> EngineState {
        self.base.state
    }

    fn iterations(&self) -> usize {
        self.base.iterations
    }

    fn engine_options(&self) -> EngineOptions {
        let options = EngineOptions::new()
            .with("particles", self.particle_number as f64)
            .with("starting-inertia", self.initial_inertia)
            .with("min-inertia", self.min_inertia)
            .with("delta", self.delta)
            .with("velocity-scaling", self.velocity_scaling)
            .with("stall-iterations", self.stall_iterations as f64);
        match self.seed {
            Some(seed) => options.with("seed", seed as f64),
            None => options,
        }
    }

    fn set_engine_options(&mut self, options: &EngineOptions) -> Result<()> {
        options.validate(&pso_options())?;
        options.update_usize("particles", &mut self.particle_number);
        options.update("starting-inertia", &mut self.initial_inertia);
        options.update("min-inertia", &mut self.min_inertia);
        options.update("delta", &mut self.delta);
        options.update("velocity-scaling", &mut self.velocity_scaling);
        options.update_usize("stall-iterations", &mut self.stall_iterations);
        if let Some(seed) = options.get("seed") {
            self.seed = Some(seed as u64);
        }
        Ok(())
    }
}
