use core::fmt;
use core::str::FromStr;

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayViewMut1, s};

use crate::learn::StageError;
use crate::optim::{MinimizeOptions, SmoothProblem, projected_gradient, projected_lbfgs};
use crate::projection::{ParseNameError, UvConstraint, shrink_to_ball};
use crate::signal::{ShapeError, construct_x_rank1, dot, l2_norm, valid_length};

const POWER_ITERATIONS: usize = 30;
const BLOCK_ITERATIONS: usize = 5;

/// Algorithm used for the dictionary update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DSolver {
    /// Alternate projected-gradient steps on the spatial and temporal parts.
    #[default]
    Alternate,
    /// Projected gradient on the concatenated `[u, v]`.
    Joint,
    /// Projected L-BFGS on the concatenated `[u, v]`.
    Lbfgs,
}

impl DSolver {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alternate => "alternate",
            Self::Joint => "joint",
            Self::Lbfgs => "lbfgs",
        }
    }
}

impl fmt::Display for DSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DSolver {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alternate" => Ok(Self::Alternate),
            "joint" => Ok(Self::Joint),
            "lbfgs" | "l_bfgs" => Ok(Self::Lbfgs),
            _ => Err(ParseNameError {
                kind: "d solver",
                name: s.to_owned(),
                expected: &["alternate", "joint", "lbfgs"],
            }),
        }
    }
}

/// Options for the dictionary update.
#[derive(Debug, Clone)]
pub struct DSolverOptions {
    pub max_iter: usize,
    /// Relative tolerance on the step (joint, lbfgs) or on the decrease of a
    /// full u/v sweep (alternate).
    pub eps: f64,
    /// L-BFGS history length.
    pub memory: usize,
}

impl Default for DSolverOptions {
    fn default() -> Self {
        Self {
            max_iter: 100,
            eps: 1e-8,
            memory: 10,
        }
    }
}

/// Strategy invoked by the driver to update the atoms with activations fixed.
pub trait DictionaryUpdate {
    /// Return new atoms of the same shape as `uv0`, inside the feasible set of
    /// `constraint`. `b_hat_0` is a fixed random vector of length
    /// `n_atoms * (n_channels + n_times_atom)` drawn once per run.
    #[allow(clippy::too_many_arguments)]
    fn update(
        &mut self,
        x: ArrayView3<'_, f64>,
        z: ArrayView3<'_, f64>,
        uv0: ArrayView2<'_, f64>,
        b_hat_0: &[f64],
        solver: DSolver,
        constraint: UvConstraint,
        options: &DSolverOptions,
    ) -> Result<Array2<f64>, StageError>;
}

/// The built-in strategy: [`update_uv`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RankOneUpdate;

impl DictionaryUpdate for RankOneUpdate {
    fn update(
        &mut self,
        x: ArrayView3<'_, f64>,
        z: ArrayView3<'_, f64>,
        uv0: ArrayView2<'_, f64>,
        b_hat_0: &[f64],
        solver: DSolver,
        constraint: UvConstraint,
        options: &DSolverOptions,
    ) -> Result<Array2<f64>, StageError> {
        Ok(update_uv(x, z, uv0, b_hat_0, solver, constraint, options)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Full,
    Spatial,
    Temporal,
}

/// `0.5 * ||x - sum_k z_k * (u_k v_k^T)||^2` as a function of one block of `uv`.
struct DictionaryProblem<'a> {
    x: ArrayView3<'a, f64>,
    z: ArrayView3<'a, f64>,
    n_channels: usize,
    constraint: UvConstraint,
    block: Block,
    uv: Array2<f64>,
}

impl DictionaryProblem<'_> {
    fn columns(&self) -> core::ops::Range<usize> {
        match self.block {
            Block::Full => 0..self.uv.ncols(),
            Block::Spatial => 0..self.n_channels,
            Block::Temporal => self.n_channels..self.uv.ncols(),
        }
    }

    fn variables(&self) -> Vec<f64> {
        self.uv.slice(s![.., self.columns()]).iter().copied().collect()
    }

    fn load(&mut self, values: &[f64]) {
        let columns = self.columns();
        for (dst, &src) in self.uv.slice_mut(s![.., columns]).iter_mut().zip(values.iter()) {
            *dst = src;
        }
    }

    fn residual(&self) -> Array3<f64> {
        let mut x_hat = construct_x_rank1(self.z, self.uv.view(), self.n_channels);
        x_hat -= &self.x;
        x_hat
    }

    /// `G[k, c, s] = sum_i sum_t z[k, i, t] * r[i, c, t + s]`.
    fn kernel_gradient(&self, residual: &Array3<f64>) -> Array3<f64> {
        let (n_atoms, n_trials, n_times_valid) = self.z.dim();
        let n_times_atom = self.uv.ncols() - self.n_channels;
        let mut grad = Array3::zeros((n_atoms, self.n_channels, n_times_atom));
        for k in 0..n_atoms {
            for i in 0..n_trials {
                for t in 0..n_times_valid {
                    let zt = self.z[[k, i, t]];
                    if zt == 0.0 {
                        continue;
                    }
                    for c in 0..self.n_channels {
                        for s in 0..n_times_atom {
                            grad[[k, c, s]] += zt * residual[[i, c, t + s]];
                        }
                    }
                }
            }
        }
        grad
    }
}

impl SmoothProblem for DictionaryProblem<'_> {
    fn value(&mut self, values: &[f64]) -> f64 {
        self.load(values);
        let residual = self.residual();
        0.5 * residual.iter().map(|r| r * r).sum::<f64>()
    }

    fn value_and_gradient(&mut self, values: &[f64], gradient: &mut [f64]) -> f64 {
        self.load(values);
        let residual = self.residual();
        let g = self.kernel_gradient(&residual);
        let (n_atoms, n_channels, n_times_atom) = g.dim();
        let width = self.columns().len();
        for k in 0..n_atoms {
            let row = &mut gradient[k * width..(k + 1) * width];
            let mut j = 0;
            if self.block != Block::Temporal {
                for c in 0..n_channels {
                    let mut sum = 0.0;
                    for s in 0..n_times_atom {
                        sum += g[[k, c, s]] * self.uv[[k, n_channels + s]];
                    }
                    row[j] = sum;
                    j += 1;
                }
            }
            if self.block != Block::Spatial {
                for s in 0..n_times_atom {
                    let mut sum = 0.0;
                    for c in 0..n_channels {
                        sum += g[[k, c, s]] * self.uv[[k, c]];
                    }
                    row[j] = sum;
                    j += 1;
                }
            }
        }
        0.5 * residual.iter().map(|r| r * r).sum::<f64>()
    }

    fn project(&self, values: &mut [f64]) {
        let width = self.columns().len();
        for (k, row) in values.chunks_mut(width).enumerate() {
            let atom = self.uv.row(k);
            let mut row = ArrayViewMut1::from(row);
            match (self.constraint, self.block) {
                (UvConstraint::Box, _) => row.mapv_inplace(|x| x.clamp(-1.0, 1.0)),
                (UvConstraint::Joint, Block::Full) => {
                    shrink_to_ball(row, 1.0);
                }
                (UvConstraint::Separate, Block::Full) => {
                    let (u, v) = row.multi_slice_mut((s![..self.n_channels], s![self.n_channels..]));
                    shrink_to_ball(u, 1.0);
                    shrink_to_ball(v, 1.0);
                }
                (UvConstraint::Separate, _) => {
                    shrink_to_ball(row, 1.0);
                }
                (UvConstraint::Joint, block) => {
                    // Ball of the radius left over by the fixed part.
                    let other = if block == Block::Spatial {
                        atom.slice(s![self.n_channels..])
                    } else {
                        atom.slice(s![..self.n_channels])
                    };
                    let radius = (1.0 - other.dot(&other)).max(0.0).sqrt();
                    shrink_to_ball(row, radius);
                }
            }
        }
    }
}

/// Largest eigenvalue of `Z^T Z` acting on single-channel kernels, by power
/// iteration started from the first `n_atoms * n_times_atom` entries of `b_hat_0`.
fn activation_lipschitz(z: ArrayView3<'_, f64>, n_times_atom: usize, b_hat_0: &[f64]) -> f64 {
    let (n_atoms, n_trials, n_times_valid) = z.dim();
    let n = n_atoms * n_times_atom;
    let n_times = n_times_valid + n_times_atom - 1;
    let mut b: Vec<f64> = if b_hat_0.len() >= n {
        b_hat_0[..n].to_vec()
    } else {
        vec![1.0; n]
    };
    let norm = l2_norm(&b);
    if norm == 0.0 {
        b.fill(1.0);
    }
    let mut y = vec![0.0; n_trials * n_times];
    let mut next = vec![0.0; n];
    let mut eig = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let norm = l2_norm(&b);
        for v in b.iter_mut() {
            *v /= norm;
        }
        y.fill(0.0);
        for k in 0..n_atoms {
            for i in 0..n_trials {
                for t in 0..n_times_valid {
                    let zt = z[[k, i, t]];
                    if zt == 0.0 {
                        continue;
                    }
                    for s in 0..n_times_atom {
                        y[i * n_times + t + s] += zt * b[k * n_times_atom + s];
                    }
                }
            }
        }
        next.fill(0.0);
        for k in 0..n_atoms {
            for i in 0..n_trials {
                for t in 0..n_times_valid {
                    let zt = z[[k, i, t]];
                    if zt == 0.0 {
                        continue;
                    }
                    for s in 0..n_times_atom {
                        next[k * n_times_atom + s] += zt * y[i * n_times + t + s];
                    }
                }
            }
        }
        eig = dot(&next, &b);
        if l2_norm(&next) == 0.0 {
            return 0.0;
        }
        b.copy_from_slice(&next);
    }
    eig
}

fn block_step(lipschitz: f64, scale: f64) -> f64 {
    let curvature = lipschitz * scale;
    if curvature > 0.0 && curvature.is_finite() {
        1.0 / curvature
    } else {
        1.0
    }
}

/// Update the rank-1 atoms with the activations held fixed.
///
/// Starts from `uv0` (projected onto the feasible set first) and never returns
/// atoms with a larger reconstruction error than that starting point.
pub fn update_uv(
    x: ArrayView3<'_, f64>,
    z: ArrayView3<'_, f64>,
    uv0: ArrayView2<'_, f64>,
    b_hat_0: &[f64],
    solver: DSolver,
    constraint: UvConstraint,
    options: &DSolverOptions,
) -> Result<Array2<f64>, ShapeError> {
    let (n_trials, n_channels, n_times) = x.dim();
    let n_atoms = uv0.nrows();
    let n_times_atom = uv0.ncols().saturating_sub(n_channels);
    if n_times_atom == 0 {
        return Err(ShapeError {
            what: "uv0",
            expected: vec![n_atoms, n_channels + 1],
            actual: uv0.shape().to_vec(),
        });
    }
    ShapeError::check(
        "z",
        &[n_atoms, n_trials, valid_length(n_times, n_times_atom)],
        z.shape(),
    )?;

    let mut problem = DictionaryProblem {
        x: x.view(),
        z: z.view(),
        n_channels,
        constraint,
        block: Block::Full,
        uv: uv0.to_owned(),
    };
    let mut values = problem.variables();
    problem.project(&mut values);
    problem.load(&values);

    let lipschitz = activation_lipschitz(z, n_times_atom, b_hat_0);
    let u_sq = max_row_sq(&problem.uv, 0..n_channels);
    let v_sq = max_row_sq(&problem.uv, n_channels..n_channels + n_times_atom);

    match solver {
        DSolver::Joint | DSolver::Lbfgs => {
            let minimize = MinimizeOptions {
                max_iters: options.max_iter,
                tol: options.eps,
                memory: options.memory,
            };
            if solver == DSolver::Joint {
                let step = block_step(lipschitz, (u_sq + v_sq).max(1.0));
                projected_gradient(&mut problem, &mut values, step, &minimize);
            } else {
                projected_lbfgs(&mut problem, &mut values, &minimize);
            }
            problem.load(&values);
        }
        DSolver::Alternate => {
            let minimize = MinimizeOptions {
                max_iters: BLOCK_ITERATIONS,
                tol: options.eps,
                memory: options.memory,
            };
            let mut previous = problem.value(&values);
            for _ in 0..options.max_iter {
                let mut value = previous;
                for block in [Block::Spatial, Block::Temporal] {
                    problem.block = block;
                    let scale = if block == Block::Spatial {
                        max_row_sq(&problem.uv, n_channels..n_channels + n_times_atom)
                    } else {
                        max_row_sq(&problem.uv, 0..n_channels)
                    };
                    let mut part = problem.variables();
                    let stats = projected_gradient(&mut problem, &mut part, block_step(lipschitz, scale), &minimize);
                    problem.load(&part);
                    value = stats.value;
                }
                if previous - value <= options.eps * previous.max(1.0) {
                    break;
                }
                previous = value;
            }
        }
    }

    Ok(problem.uv)
}

fn max_row_sq(uv: &Array2<f64>, range: core::ops::Range<usize>) -> f64 {
    uv.rows()
        .into_iter()
        .map(|atom| {
            let part = atom.slice(s![range.clone()]);
            part.dot(&part)
        })
        .fold(0.0_f64, f64::max)
}
