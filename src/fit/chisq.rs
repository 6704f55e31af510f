//! Weighted chi-square minimisation through argmin's L-BFGS.
//!
//! Parameters are kept inside box bounds by clamping; the gradient is
//! projected so the line search does not push further past a bound.

use argmin::core::{
    CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;

use crate::error::FitError;

const TOL_GRAD: f64 = 1e-6;
const TOL_COST: f64 = 1e-10;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Point {
    pub x: f64,
    pub y: f64,
    pub weight: f64,
}

/// `sum(weight * (y - model(x))^2)` as an argmin problem.
///
/// `model` returns the function value and its gradient with respect to the
/// parameters.
struct ChiSquare<'a, M, const N: usize> {
    model: &'a M,
    points: &'a [Point],
    bounds: &'a [(f64, f64); N],
}

fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params
        .iter()
        .zip(bounds.iter())
        .map(|(&v, &(lo, hi))| v.clamp(lo, hi))
        .collect()
}

impl<M, const N: usize> CostFunction for ChiSquare<'_, M, N>
where
    M: Fn(f64, &[f64]) -> (f64, [f64; N]),
{
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let p = clamp_params(params, self.bounds);
        Ok(self
            .points
            .iter()
            .map(|pt| {
                let r = pt.y - (self.model)(pt.x, p.as_slice()).0;
                pt.weight * r * r
            })
            .sum())
    }
}

impl<M, const N: usize> Gradient for ChiSquare<'_, M, N>
where
    M: Fn(f64, &[f64]) -> (f64, [f64; N]),
{
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let p = clamp_params(params, self.bounds);
        let mut g = vec![0.0; N];
        for pt in self.points {
            let (f, df) = (self.model)(pt.x, p.as_slice());
            let r = pt.y - f;
            for (gi, dfi) in g.iter_mut().zip(df) {
                *gi -= 2.0 * pt.weight * r * dfi;
            }
        }

        // at a bound, drop components pointing further out
        for (gi, (&x, &(lo, hi))) in g.iter_mut().zip(p.iter().zip(self.bounds.iter())) {
            if (x <= lo && *gi > 0.0) || (x >= hi && *gi < 0.0) {
                *gi = 0.0;
            }
        }
        Ok(g)
    }
}

/// Minimise the weighted chi-square of `model` over `points`, starting from
/// `start` and staying within `bounds`.
pub(crate) fn minimize<const N: usize, M>(
    model: M,
    points: &[Point],
    start: [f64; N],
    bounds: [(f64, f64); N],
    max_iterations: u64,
) -> Result<[f64; N], FitError>
where
    M: Fn(f64, &[f64]) -> (f64, [f64; N]),
{
    if points.len() < N {
        return Err(FitError::InsufficientData {
            points: points.len(),
            parameters: N,
        });
    }

    let problem = ChiSquare {
        model: &model,
        points,
        bounds: &bounds,
    };
    let not_converged = |iterations: u64| FitError::NotConverged {
        iterations: iterations as usize,
    };

    let solver = LBFGS::new(MoreThuenteLineSearch::new(), N.max(3))
        .with_tolerance_grad(TOL_GRAD)
        .map_err(|_| not_converged(0))?
        .with_tolerance_cost(TOL_COST)
        .map_err(|_| not_converged(0))?;

    let res = Executor::new(problem, solver)
        .configure(|state| {
            state
                .param(clamp_params(&start, &bounds))
                .max_iters(max_iterations)
        })
        .run()
        .map_err(|e| {
            log::trace!("chi-square minimisation failed: {e}");
            not_converged(0)
        })?;

    let state = res.state();
    let converged = matches!(
        state.get_termination_status(),
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
    );
    if !converged {
        return Err(not_converged(state.get_iter()));
    }
    let best = state
        .get_best_param()
        .ok_or_else(|| not_converged(state.get_iter()))?;

    let mut out = [0.0; N];
    for (o, v) in out.iter_mut().zip(clamp_params(best, &bounds)) {
        *o = v;
    }
    Ok(out)
}
