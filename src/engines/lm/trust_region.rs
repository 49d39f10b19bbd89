//! Damping control for the trust-region Levenberg-Marquardt engines.
//!
//! The damping μ grows when a step is rejected and shrinks when the gain
//! ratio (actual over predicted reduction) says the local model is good.

/// How μ is updated from the gain ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Damping {
    /// Multiply or divide by 10.
    Classic,
    /// Nielsen's smooth update, μ *= max(1/3, 1 - (2ρ - 1)³).
    Nielsen,
}

/// Trust region state: current damping and its update rule.
#[derive(Debug, Clone)]
pub struct TrustRegion {
    /// Current value of the damping parameter
    pub mu: f64,

    /// Growth factor of μ on rejected steps (Nielsen only)
    pub nu: f64,

    pub damping: Damping,

    /// Minimum allowed value for the damping parameter
    pub mu_min: f64,

    /// Maximum allowed value for the damping parameter
    pub mu_max: f64,

    /// Minimum gain ratio required to accept a step
    pub min_gain_ratio: f64,

    /// Gain ratio above which the classic rule decreases μ
    pub good_gain_ratio: f64,
}

impl TrustRegion {
    pub fn new(damping: Damping, mu: f64) -> Self {
        Self {
            mu,
            nu: 2.0,
            damping,
            mu_min: 1e-15,
            mu_max: 1e15,
            min_gain_ratio: match damping {
                Damping::Classic => 1e-3,
                Damping::Nielsen => 0.0,
            },
            good_gain_ratio: 0.25,
        }
    }

    /// Updates μ from the gain ratio and tells whether the step is accepted.
    pub fn update(&mut self, gain_ratio: f64) -> bool {
        let accepted = gain_ratio > self.min_gain_ratio;
        match (self.damping, accepted) {
            (Damping::Classic, true) => {
                if gain_ratio > self.good_gain_ratio {
                    self.mu *= 0.1;
                }
            }
            (Damping::Classic, false) => self.mu *= 10.0,
            (Damping::Nielsen, true) => {
                let t = 2.0 * gain_ratio - 1.0;
                self.mu *= (1.0 - t * t * t).max(1.0 / 3.0);
                self.nu = 2.0;
            }
            (Damping::Nielsen, false) => {
                self.mu *= self.nu;
                self.nu *= 2.0;
            }
        }
        self.mu = self.mu.clamp(self.mu_min, self.mu_max);
        accepted
    }

    /// Ratio of actual to predicted reduction of the cost.
    pub fn gain_ratio(current_cost: f64, new_cost: f64, predicted_reduction: f64) -> f64 {
        let actual_reduction = current_cost - new_cost;

        if predicted_reduction.abs() < 1e-300 {
            if actual_reduction.abs() < 1e-300 {
                1.0
            } else {
                0.0
            }
        } else {
            actual_reduction / predicted_reduction
        }
    }

    /// Starts over with damping `mu`.
    pub fn reset(&mut self, mu: f64) {
        *self = Self::new(self.damping, mu);
    }
}
