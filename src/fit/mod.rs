//! Curve-fit and peak-search services.
//!
//! The calibration only needs two fits: a Gaussian over a window of a
//! histogram and an error-function S-curve over a threshold scan. Both sit
//! behind [`CurveFitter`] so a different minimiser can be plugged in.

mod chisq;
pub mod peaks;

use std::f64::consts::{FRAC_2_SQRT_PI, SQRT_2};

use statrs::function::erf::erf;

use crate::error::FitError;
use chisq::Point;

/// Gaussian `amplitude * exp(-0.5 * ((x - mean) / sigma)^2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gaussian {
    pub amplitude: f64,
    pub mean: f64,
    pub sigma: f64,
}

impl Gaussian {
    pub fn eval(&self, x: f64) -> f64 {
        let z = (x - self.mean) / self.sigma;
        self.amplitude * (-0.5 * z * z).exp()
    }
}

/// Fitted S-curve `plateau / 2 * (1 + erf((x - threshold) / (sqrt(2) * width)))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SCurve {
    pub threshold: f64,
    pub width: f64,
    pub plateau: f64,
}

pub trait CurveFitter {
    /// Fit a Gaussian to the `(x, y)` points with `window.0 <= x <= window.1`,
    /// starting from `seed`.
    fn fit_gaussian(
        &self,
        sample: &[(f64, f64)],
        window: (f64, f64),
        seed: Gaussian,
    ) -> Result<Gaussian, FitError>;

    /// Fit an S-curve to hit counts `ys` recorded at stimulus values `xs`.
    fn fit_scurve(&self, xs: &[f64], ys: &[f64]) -> Result<SCurve, FitError>;
}

/// Bounded least-squares fitter minimising chi-square with L-BFGS.
///
/// Histogram fits use Poisson weights and skip empty bins; S-curve fits are
/// unweighted with the plateau fixed at the largest observed count.
#[derive(Debug, Clone, Copy)]
pub struct LeastSquares {
    pub max_iterations: u64,
}

impl Default for LeastSquares {
    fn default() -> Self {
        Self {
            max_iterations: 500,
        }
    }
}

impl CurveFitter for LeastSquares {
    fn fit_gaussian(
        &self,
        sample: &[(f64, f64)],
        window: (f64, f64),
        seed: Gaussian,
    ) -> Result<Gaussian, FitError> {
        let points: Vec<Point> = sample
            .iter()
            .filter(|(x, y)| *x >= window.0 && *x <= window.1 && *y > 0.0)
            .map(|&(x, y)| Point {
                x,
                y,
                weight: 1.0 / y,
            })
            .collect();

        let gauss = |x: f64, p: &[f64]| {
            let d = x - p[1];
            let s2 = p[2] * p[2];
            let e = (-0.5 * d * d / s2).exp();
            let f = p[0] * e;
            (f, [e, f * d / s2, f * d * d / (s2 * p[2])])
        };
        let span = (window.1 - window.0).max(1e-3);
        let p = chisq::minimize(
            gauss,
            &points,
            [seed.amplitude, seed.mean, seed.sigma],
            [(1e-9, 1e12), window, (1e-3, span)],
            self.max_iterations,
        )?;

        let fit = Gaussian {
            amplitude: p[0],
            mean: p[1],
            sigma: p[2],
        };
        if !(fit.amplitude.is_finite() && fit.mean.is_finite() && fit.sigma.is_finite()) {
            return Err(FitError::NotConverged {
                iterations: self.max_iterations as usize,
            });
        }
        Ok(fit)
    }

    fn fit_scurve(&self, xs: &[f64], ys: &[f64]) -> Result<SCurve, FitError> {
        let plateau = ys.iter().copied().fold(0.0, f64::max);
        if plateau <= 0.0 {
            return Err(FitError::NoTransition);
        }
        let half = 0.5 * plateau;
        let Some(first) = ys.iter().position(|&y| y >= half) else {
            return Err(FitError::NoTransition);
        };
        if !ys.iter().any(|&y| y < half) {
            return Err(FitError::NoTransition);
        }

        let seed_threshold = if first == 0 {
            xs[0]
        } else {
            let (x0, x1) = (xs[first - 1], xs[first]);
            let (y0, y1) = (ys[first - 1], ys[first]);
            x0 + (half - y0) / (y1 - y0) * (x1 - x0)
        };

        let points: Vec<Point> = xs
            .iter()
            .zip(ys.iter())
            .map(|(&x, &y)| Point { x, y, weight: 1.0 })
            .collect();

        let scurve = |x: f64, p: &[f64]| {
            let z = (x - p[0]) / (SQRT_2 * p[1]);
            let f = 0.5 * plateau * (1.0 + erf(z));
            let dz = 0.5 * plateau * FRAC_2_SQRT_PI * (-z * z).exp();
            (f, [-dz / (SQRT_2 * p[1]), -dz * z / p[1]])
        };
        let (lo, hi) = xs
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
        let p = chisq::minimize(
            scurve,
            &points,
            [seed_threshold, 2.0],
            [(lo - 100.0, hi + 100.0), (1e-2, (hi - lo).max(1.0))],
            self.max_iterations,
        )?;

        if !(p[0].is_finite() && p[1].is_finite()) {
            return Err(FitError::NotConverged {
                iterations: self.max_iterations as usize,
            });
        }
        Ok(SCurve {
            threshold: p[0],
            width: p[1],
            plateau,
        })
    }
}
