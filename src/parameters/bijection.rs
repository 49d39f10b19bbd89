//! Monotone transforms between optimizer space and natural space.
//!
//! A free parameter may be seen by the optimizer through a bijection: the
//! optimizer works on `x` and the model sees `forward(x)`. This keeps a
//! positive parameter positive (`Log`) or keeps a parameter inside an open
//! interval (`Range`) without any constraint in the engines.

use crate::error::{FitError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Value returned by the backward log transform for non-positive values.
const LOG_FLOOR: f64 = -200.0;

/// Bound on the optimizer-space value of the range transform.
const RANGE_SATURATION: f64 = 80.0;

/// A monotone bijection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Bijection {
    /// natural = exp(optimizer)
    Log,
    /// natural = (low + high)/2 + (high - low)/2 * tanh(optimizer)
    Range { low: f64, high: f64 },
}

impl Bijection {
    /// Build a range bijection.
    ///
    /// # Errors
    ///
    /// Returns a structural error unless `low < high`, both finite.
    pub fn range(low: f64, high: f64) -> Result<Self> {
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(FitError::Structural(format!(
                "invalid range bijection [{}, {}]",
                low, high
            )));
        }
        Ok(Bijection::Range { low, high })
    }

    /// Optimizer space to natural space.
    pub fn forward(&self, x: f64) -> f64 {
        match *self {
            Bijection::Log => x.exp(),
            Bijection::Range { low, high } => 0.5 * (low + high) + 0.5 * (high - low) * x.tanh(),
        }
    }

    /// Natural space to optimizer space.
    pub fn backward(&self, y: f64) -> f64 {
        match *self {
            Bijection::Log => {
                if y <= 0.0 {
                    LOG_FLOOR
                } else {
                    y.ln()
                }
            }
            Bijection::Range { low, high } => {
                let u = (2.0 * y - (low + high)) / (high - low);
                if u <= -1.0 {
                    -RANGE_SATURATION
                } else if u >= 1.0 {
                    RANGE_SATURATION
                } else {
                    u.atanh().clamp(-RANGE_SATURATION, RANGE_SATURATION)
                }
            }
        }
    }

    /// Derivative of [`forward`](Self::forward) at `x`.
    pub fn derivative(&self, x: f64) -> f64 {
        match *self {
            Bijection::Log => x.exp(),
            Bijection::Range { low, high } => {
                let c = x.cosh();
                0.5 * (high - low) / (c * c)
            }
        }
    }
}

impl fmt::Display for Bijection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bijection::Log => write!(f, "log"),
            Bijection::Range { low, high } => write!(f, "range:{},{}", low, high),
        }
    }
}

impl FromStr for Bijection {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "log" {
            return Ok(Bijection::Log);
        }
        if let Some(rest) = s.strip_prefix("range:") {
            let mut bounds = rest.split(',').map(|v| v.trim().parse::<f64>());
            if let (Some(Ok(low)), Some(Ok(high)), None) =
                (bounds.next(), bounds.next(), bounds.next())
            {
                return Bijection::range(low, high);
            }
        }
        Err(FitError::Structural(format!("unknown bijection: '{}'", s)))
    }
}
