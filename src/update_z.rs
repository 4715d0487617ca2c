use core::fmt;
use core::str::FromStr;

use ndarray::{Array3, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

use crate::optim::{MinimizeOptions, SmoothProblem, fista, projected_gradient, projected_lbfgs};
use crate::parallel::Workers;
use crate::projection::ParseNameError;
use crate::signal::{Rank1Operator, ShapeError, dot, trial_activations, trial_signal, valid_length};

const POWER_ITERATIONS: usize = 50;

/// Algorithm used for the non-negative sparse-code update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZSolver {
    /// Projected L-BFGS.
    #[default]
    Lbfgs,
    /// Projected gradient with backtracking.
    Ista,
    /// Monotone accelerated projected gradient.
    Fista,
}

impl ZSolver {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lbfgs => "lbfgs",
            Self::Ista => "ista",
            Self::Fista => "fista",
        }
    }
}

impl fmt::Display for ZSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZSolver {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lbfgs" | "l_bfgs" => Ok(Self::Lbfgs),
            "ista" => Ok(Self::Ista),
            "fista" => Ok(Self::Fista),
            _ => Err(ParseNameError {
                kind: "z solver",
                name: s.to_owned(),
                expected: &["lbfgs", "l_bfgs", "ista", "fista"],
            }),
        }
    }
}

/// Options for the per-trial sparse-code solves.
#[derive(Debug, Clone)]
pub struct ZSolverOptions {
    pub max_iter: usize,
    pub tol: f64,
    /// L-BFGS history length.
    pub memory: usize,
}

impl Default for ZSolverOptions {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tol: 1e-8,
            memory: 10,
        }
    }
}

/// `0.5 * ||x_i - A z||^2 + reg * sum(z)` over `z >= 0` for one trial.
struct SparseCodeProblem<'a, 'op> {
    op: &'a Rank1Operator<'op>,
    target: &'a [f64],
    reg: f64,
    residual: Vec<f64>,
    scratch: Vec<f64>,
}

impl<'a, 'op> SparseCodeProblem<'a, 'op> {
    fn new(op: &'a Rank1Operator<'op>, target: &'a [f64], reg: f64) -> Self {
        Self {
            op,
            target,
            reg,
            residual: vec![0.0; op.output_len()],
            scratch: vec![0.0; op.n_times()],
        }
    }

    fn fill_residual(&mut self, z: &[f64]) -> f64 {
        self.op.apply(z, &mut self.residual, &mut self.scratch);
        for (r, &t) in self.residual.iter_mut().zip(self.target.iter()) {
            *r -= t;
        }
        0.5 * dot(&self.residual, &self.residual) + self.reg * z.iter().sum::<f64>()
    }
}

impl SmoothProblem for SparseCodeProblem<'_, '_> {
    fn value(&mut self, z: &[f64]) -> f64 {
        self.fill_residual(z)
    }

    fn value_and_gradient(&mut self, z: &[f64], gradient: &mut [f64]) -> f64 {
        let value = self.fill_residual(z);
        self.op.adjoint(&self.residual, gradient, &mut self.scratch);
        for g in gradient.iter_mut() {
            *g += self.reg;
        }
        value
    }

    fn project(&self, z: &mut [f64]) {
        for v in z {
            *v = v.max(0.0);
        }
    }
}

/// Update the activations of every trial with the atoms held fixed.
///
/// `x` has shape `(n_trials, n_channels, n_times)`, `uv` has shape
/// `(n_atoms, n_channels + n_times_atom)` and the warm start `z0` has shape
/// `(n_atoms, n_trials, n_times_valid)`. Trials are solved in parallel on
/// `workers`. The returned activations are non-negative.
pub fn update_z_multi(
    x: ArrayView3<'_, f64>,
    uv: ArrayView2<'_, f64>,
    reg: f64,
    z0: ArrayView3<'_, f64>,
    workers: &Workers,
    solver: ZSolver,
    options: &ZSolverOptions,
) -> Result<Array3<f64>, ShapeError> {
    let (n_trials, n_channels, n_times) = x.dim();
    let n_atoms = uv.nrows();
    let n_times_atom = uv.ncols().saturating_sub(n_channels);
    if n_times_atom == 0 || n_times_atom > n_times {
        return Err(ShapeError {
            what: "uv",
            expected: vec![n_atoms, n_channels + n_times_atom.clamp(1, n_times.max(1))],
            actual: vec![uv.nrows(), uv.ncols()],
        });
    }
    let n_times_valid = valid_length(n_times, n_times_atom);
    ShapeError::check("z0", &[n_atoms, n_trials, n_times_valid], z0.shape())?;

    let op = Rank1Operator::new(uv, n_channels, n_times_valid);
    let lipschitz = op.lipschitz(POWER_ITERATIONS);
    let step = if lipschitz > 0.0 { 1.0 / lipschitz } else { 1.0 };
    let minimize = MinimizeOptions {
        max_iters: options.max_iter,
        tol: options.tol,
        memory: options.memory,
    };

    let solutions: Vec<Vec<f64>> = workers.install(|| {
        (0..n_trials)
            .into_par_iter()
            .map(|i| {
                let target = trial_signal(x, i);
                let mut zi = trial_activations(z0, i);
                let mut problem = SparseCodeProblem::new(&op, &target, reg);
                problem.project(&mut zi);
                let stats = match solver {
                    ZSolver::Ista => projected_gradient(&mut problem, &mut zi, step, &minimize),
                    ZSolver::Fista => fista(&mut problem, &mut zi, step, &minimize),
                    ZSolver::Lbfgs => projected_lbfgs(&mut problem, &mut zi, &minimize),
                };
                log::trace!(
                    "trial {i}: {solver} {:?} after {} iterations, objective {:.6e}",
                    stats.status,
                    stats.iterations,
                    stats.value
                );
                zi
            })
            .collect()
    });

    let mut z = Array3::zeros((n_atoms, n_trials, n_times_valid));
    for (i, zi) in solutions.iter().enumerate() {
        for (dst, &src) in z.index_axis_mut(Axis(1), i).iter_mut().zip(zi.iter()) {
            *dst = src;
        }
    }
    Ok(z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::{Evaluation, compute_objective};
    use ndarray::{Array2, array};

    fn workers() -> Workers {
        Workers::new(2).unwrap()
    }

    fn problem() -> (Array3<f64>, Array2<f64>, Array3<f64>) {
        let uv = array![[0.6, 0.8, 0.5, 0.5, 0.5, 0.5], [0.8, -0.6, 0.5, -0.5, 0.5, -0.5]];
        let mut z = Array3::zeros((2, 2, 17));
        z[[0, 0, 2]] = 2.0;
        z[[1, 0, 9]] = 1.0;
        z[[0, 1, 5]] = 1.5;
        z[[1, 1, 14]] = 3.0;
        let x = crate::signal::construct_x_rank1(z.view(), uv.view(), 2);
        (x, uv, z)
    }

    #[test]
    fn parses_names() {
        assert_eq!("l_bfgs".parse::<ZSolver>(), Ok(ZSolver::Lbfgs));
        assert_eq!("fista".parse::<ZSolver>(), Ok(ZSolver::Fista));
        assert!("cd".parse::<ZSolver>().is_err());
    }

    #[test]
    fn solvers_decrease_objective_and_stay_non_negative() {
        let (x, uv, _) = problem();
        let z0 = Array3::zeros((2, 2, 17));
        let reg = 0.05;
        let start = compute_objective(x.view(), z0.view(), uv.view(), reg, Evaluation::Raw);
        for solver in [ZSolver::Lbfgs, ZSolver::Ista, ZSolver::Fista] {
            let z = update_z_multi(x.view(), uv.view(), reg, z0.view(), &workers(), solver, &ZSolverOptions::default())
                .unwrap();
            assert!(z.iter().all(|&v| v >= 0.0));
            let value = compute_objective(x.view(), z.view(), uv.view(), reg, Evaluation::Raw);
            assert!(value < 0.1 * start, "{solver}: {value} vs {start}");
        }
    }

    #[test]
    fn warm_start_never_increases_objective() {
        let (x, uv, z_true) = problem();
        let reg = 0.1;
        let z0 = z_true.mapv(|v| 0.5 * v);
        let start = compute_objective(x.view(), z0.view(), uv.view(), reg, Evaluation::Raw);
        for solver in [ZSolver::Lbfgs, ZSolver::Ista, ZSolver::Fista] {
            let options = ZSolverOptions { max_iter: 2, ..ZSolverOptions::default() };
            let z = update_z_multi(x.view(), uv.view(), reg, z0.view(), &workers(), solver, &options).unwrap();
            let value = compute_objective(x.view(), z.view(), uv.view(), reg, Evaluation::Raw);
            assert!(value <= start * (1.0 + 1e-12), "{solver}");
        }
    }

    #[test]
    fn huge_regularization_gives_zero_activations() {
        let (x, uv, _) = problem();
        let z0 = Array3::zeros((2, 2, 17));
        for solver in [ZSolver::Lbfgs, ZSolver::Ista, ZSolver::Fista] {
            let z = update_z_multi(x.view(), uv.view(), 1e6, z0.view(), &workers(), solver, &ZSolverOptions::default())
                .unwrap();
            assert!(z.iter().all(|&v| v == 0.0), "{solver}");
        }
    }

    #[test]
    fn rejects_mismatched_warm_start() {
        let (x, uv, _) = problem();
        let z0 = Array3::zeros((2, 2, 16));
        let err = update_z_multi(x.view(), uv.view(), 0.1, z0.view(), &workers(), ZSolver::Ista, &ZSolverOptions::default())
            .unwrap_err();
        assert_eq!(err.what, "z0");
        assert_eq!(err.expected, vec![2, 2, 17]);
    }
}
