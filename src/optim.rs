//! First-order minimizers for smooth objectives over a convex set.
//!
//! Every routine starts from a feasible `x`, only ever accepts points that do
//! not increase the objective, and leaves the best accepted point in `x`.

use std::collections::VecDeque;

use crate::signal::{dot, max_abs};

const MAX_BACKTRACKS: usize = 40;
const ARMIJO: f64 = 1e-4;

/// Smooth objective restricted to a convex set with a cheap projection.
pub(crate) trait SmoothProblem {
    /// Objective value at `x`.
    fn value(&mut self, x: &[f64]) -> f64;
    /// Objective value at `x`, with its gradient written to `gradient`.
    fn value_and_gradient(&mut self, x: &[f64], gradient: &mut [f64]) -> f64;
    /// Project `x` onto the feasible set in place.
    fn project(&self, x: &mut [f64]);
}

#[derive(Debug, Clone)]
pub(crate) struct MinimizeOptions {
    pub max_iters: usize,
    /// Stop when the largest coordinate change is below `tol * max(1, ||x||_inf)`.
    pub tol: f64,
    /// L-BFGS history length.
    pub memory: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MinimizeStatus {
    ConvergedStep,
    ConvergedGradient,
    LineSearchStalled,
    MaxIterations,
}

#[derive(Debug, Clone)]
pub(crate) struct MinimizeStats {
    pub status: MinimizeStatus,
    pub iterations: usize,
    pub value: f64,
}

fn step_converged(change: f64, x: &[f64], tol: f64) -> bool {
    change <= tol * max_abs(x).max(1.0)
}

/// Projected gradient descent (ISTA) with backtracking from `step`.
pub(crate) fn projected_gradient(
    problem: &mut impl SmoothProblem,
    x: &mut [f64],
    step: f64,
    options: &MinimizeOptions,
) -> MinimizeStats {
    let n = x.len();
    let mut gradient = vec![0.0; n];
    let mut trial = vec![0.0; n];
    let mut value = problem.value_and_gradient(x, &mut gradient);
    let mut step = if step.is_finite() && step > 0.0 { step } else { 1.0 };

    for iter in 0..options.max_iters {
        let mut accepted = false;
        for _ in 0..MAX_BACKTRACKS {
            for i in 0..n {
                trial[i] = x[i] - step * gradient[i];
            }
            problem.project(&mut trial);
            let mut linear = 0.0;
            let mut squared = 0.0;
            for i in 0..n {
                let d = trial[i] - x[i];
                linear += gradient[i] * d;
                squared += d * d;
            }
            if squared == 0.0 {
                return MinimizeStats {
                    status: MinimizeStatus::ConvergedGradient,
                    iterations: iter,
                    value,
                };
            }
            let trial_value = problem.value(&trial);
            if trial_value <= value + linear + squared / (2.0 * step) && trial_value <= value {
                accepted = true;
                break;
            }
            step *= 0.5;
        }
        if !accepted {
            return MinimizeStats {
                status: MinimizeStatus::LineSearchStalled,
                iterations: iter,
                value,
            };
        }

        let mut change = 0.0_f64;
        for i in 0..n {
            change = change.max((trial[i] - x[i]).abs());
        }
        x.copy_from_slice(&trial);
        value = problem.value_and_gradient(x, &mut gradient);
        if step_converged(change, x, options.tol) {
            return MinimizeStats {
                status: MinimizeStatus::ConvergedStep,
                iterations: iter + 1,
                value,
            };
        }
    }

    MinimizeStats {
        status: MinimizeStatus::MaxIterations,
        iterations: options.max_iters,
        value,
    }
}

/// Monotone FISTA: accelerated projected gradient that never accepts an
/// iterate worse than the current one.
pub(crate) fn fista(
    problem: &mut impl SmoothProblem,
    x: &mut [f64],
    step: f64,
    options: &MinimizeOptions,
) -> MinimizeStats {
    let n = x.len();
    let mut y = x.to_vec();
    let mut grad_y = vec![0.0; n];
    let mut candidate = vec![0.0; n];
    let mut previous = x.to_vec();
    let mut value = problem.value(x);
    let mut momentum = 1.0_f64;
    let mut step = if step.is_finite() && step > 0.0 { step } else { 1.0 };

    for iter in 0..options.max_iters {
        let value_y = problem.value_and_gradient(&y, &mut grad_y);
        let mut accepted = false;
        let mut candidate_value = f64::INFINITY;
        let mut change = 0.0_f64;
        for _ in 0..MAX_BACKTRACKS {
            for i in 0..n {
                candidate[i] = y[i] - step * grad_y[i];
            }
            problem.project(&mut candidate);
            let mut linear = 0.0;
            let mut squared = 0.0;
            change = 0.0;
            for i in 0..n {
                let d = candidate[i] - y[i];
                linear += grad_y[i] * d;
                squared += d * d;
                change = change.max(d.abs());
            }
            candidate_value = problem.value(&candidate);
            if squared == 0.0 || candidate_value <= value_y + linear + squared / (2.0 * step) {
                accepted = true;
                break;
            }
            step *= 0.5;
        }
        if !accepted {
            return MinimizeStats {
                status: MinimizeStatus::LineSearchStalled,
                iterations: iter,
                value,
            };
        }

        let next_momentum = 0.5 * (1.0 + (1.0 + 4.0 * momentum * momentum).sqrt());
        previous.copy_from_slice(x);
        if candidate_value <= value {
            x.copy_from_slice(&candidate);
            value = candidate_value;
        }
        // y = x + (t / t') (candidate - x) + ((t - 1) / t') (x - previous)
        let a = momentum / next_momentum;
        let b = (momentum - 1.0) / next_momentum;
        for i in 0..n {
            y[i] = x[i] + a * (candidate[i] - x[i]) + b * (x[i] - previous[i]);
        }
        problem.project(&mut y);
        momentum = next_momentum;

        if step_converged(change, x, options.tol) {
            return MinimizeStats {
                status: MinimizeStatus::ConvergedStep,
                iterations: iter + 1,
                value,
            };
        }
    }

    MinimizeStats {
        status: MinimizeStatus::MaxIterations,
        iterations: options.max_iters,
        value,
    }
}

struct Correction {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// Projected L-BFGS with Armijo backtracking along the projection arc.
pub(crate) fn projected_lbfgs(
    problem: &mut impl SmoothProblem,
    x: &mut [f64],
    options: &MinimizeOptions,
) -> MinimizeStats {
    let n = x.len();
    let memory = options.memory.max(1);
    let mut history: VecDeque<Correction> = VecDeque::with_capacity(memory);
    let mut gradient = vec![0.0; n];
    let mut new_gradient = vec![0.0; n];
    let mut direction = vec![0.0; n];
    let mut trial = vec![0.0; n];
    let mut alpha = vec![0.0; memory];
    let mut value = problem.value_and_gradient(x, &mut gradient);

    let mut iter = 0;
    while iter < options.max_iters {
        // Projected gradient stationarity.
        for i in 0..n {
            trial[i] = x[i] - gradient[i];
        }
        problem.project(&mut trial);
        let mut pg = 0.0_f64;
        for i in 0..n {
            pg = pg.max((trial[i] - x[i]).abs());
        }
        if pg <= options.tol {
            return MinimizeStats {
                status: MinimizeStatus::ConvergedGradient,
                iterations: iter,
                value,
            };
        }

        two_loop(&history, &gradient, &mut direction, &mut alpha);
        if dot(&direction, &gradient) >= 0.0 {
            history.clear();
            for i in 0..n {
                direction[i] = -gradient[i];
            }
        }
        let mut step = if history.is_empty() {
            (1.0 / max_abs(&gradient)).min(1.0)
        } else {
            1.0
        };

        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            for i in 0..n {
                trial[i] = x[i] + step * direction[i];
            }
            problem.project(&mut trial);
            let mut descent = 0.0;
            for i in 0..n {
                descent += gradient[i] * (trial[i] - x[i]);
            }
            if descent < 0.0 {
                let trial_value = problem.value(&trial);
                if trial_value <= value + ARMIJO * descent {
                    accepted = Some(trial_value);
                    break;
                }
            }
            step *= 0.5;
        }

        if accepted.is_none() {
            if history.is_empty() {
                return MinimizeStats {
                    status: MinimizeStatus::LineSearchStalled,
                    iterations: iter,
                    value,
                };
            }
            // Drop the curvature model and retry with steepest descent.
            history.clear();
            continue;
        }

        let new_value = problem.value_and_gradient(&trial, &mut new_gradient);
        let mut s = vec![0.0; n];
        let mut y = vec![0.0; n];
        let mut change = 0.0_f64;
        for i in 0..n {
            s[i] = trial[i] - x[i];
            y[i] = new_gradient[i] - gradient[i];
            change = change.max(s[i].abs());
        }
        let sy = dot(&s, &y);
        if sy > 1e-12 * dot(&y, &y).max(f64::MIN_POSITIVE) {
            if history.len() == memory {
                history.pop_front();
            }
            history.push_back(Correction { s, y, rho: 1.0 / sy });
        }

        x.copy_from_slice(&trial);
        gradient.copy_from_slice(&new_gradient);
        value = new_value;
        iter += 1;

        if step_converged(change, x, options.tol) {
            return MinimizeStats {
                status: MinimizeStatus::ConvergedStep,
                iterations: iter,
                value,
            };
        }
    }

    MinimizeStats {
        status: MinimizeStatus::MaxIterations,
        iterations: options.max_iters,
        value,
    }
}

/// `direction = -H g` from the stored curvature pairs.
fn two_loop(history: &VecDeque<Correction>, gradient: &[f64], direction: &mut [f64], alpha: &mut [f64]) {
    direction.copy_from_slice(gradient);
    for (j, pair) in history.iter().enumerate().rev() {
        let a = pair.rho * dot(&pair.s, direction);
        alpha[j] = a;
        for (d, &y) in direction.iter_mut().zip(pair.y.iter()) {
            *d -= a * y;
        }
    }
    if let Some(last) = history.back() {
        let gamma = dot(&last.s, &last.y) / dot(&last.y, &last.y);
        for d in direction.iter_mut() {
            *d *= gamma;
        }
    }
    for (j, pair) in history.iter().enumerate() {
        let b = pair.rho * dot(&pair.y, direction);
        for (d, &s) in direction.iter_mut().zip(pair.s.iter()) {
            *d += (alpha[j] - b) * s;
        }
    }
    for d in direction.iter_mut() {
        *d = -*d;
    }
}
