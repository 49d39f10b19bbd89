//! # Confidence Intervals
//!
//! Turns standard errors into confidence intervals using the Student t
//! distribution with the degrees of freedom of the fit.

use crate::error::{FitError, Result};

/// Natural log of the gamma function (Lanczos approximation).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut series = 1.000_000_000_190_015;
    for c in COEFFS {
        y += 1.0;
        series += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * series / x).ln()
}

/// Continued fraction of the incomplete beta function.
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITERATIONS: usize = 300;
    const EPS: f64 = 3e-16;
    const FPMIN: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;
    for m in 1..=MAX_ITERATIONS {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta function I_x(a, b).
fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let front = (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln()).exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// Cumulative distribution function of the Student t distribution.
pub fn student_t_cdf(t: f64, dof: f64) -> f64 {
    let x = dof / (dof + t * t);
    let tail = 0.5 * incomplete_beta(0.5 * dof, 0.5, x);
    if t >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Quantile of the Student t distribution, by bisection on the CDF.
///
/// # Errors
///
/// Returns a structural error unless `0 < p < 1` and `dof > 0`.
pub fn student_t_quantile(p: f64, dof: usize) -> Result<f64> {
    if !(p > 0.0 && p < 1.0) || dof == 0 {
        return Err(FitError::Structural(format!(
            "invalid t quantile request p = {}, dof = {}",
            p, dof
        )));
    }
    if p < 0.5 {
        return Ok(-student_t_quantile(1.0 - p, dof)?);
    }
    let nu = dof as f64;
    let (mut low, mut high) = (0.0, 1.0);
    while student_t_cdf(high, nu) < p {
        high *= 2.0;
        if high > 1e12 {
            break;
        }
    }
    for _ in 0..200 {
        let mid = 0.5 * (low + high);
        if student_t_cdf(mid, nu) < p {
            low = mid;
        } else {
            high = mid;
        }
        if high - low < 1e-12 * high.max(1.0) {
            break;
        }
    }
    Ok(0.5 * (low + high))
}

/// Factor by which a standard error is multiplied to get the half-width
/// of the two-sided confidence interval at `level` (e.g. 0.95).
pub fn confidence_factor(level: f64, dof: usize) -> Result<f64> {
    student_t_quantile(0.5 * (1.0 + level), dof)
}

/// Two-sided confidence intervals `(low, high)` for each value.
pub fn confidence_intervals(
    values: &[f64],
    errors: &[f64],
    dof: usize,
    level: f64,
) -> Result<Vec<(f64, f64)>> {
    let factor = confidence_factor(level, dof)?;
    Ok(values
        .iter()
        .zip(errors)
        .map(|(&v, &e)| (v - factor * e, v + factor * e))
        .collect())
}
