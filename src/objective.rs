use ndarray::{ArrayView2, ArrayView3, Axis};

use crate::projection::{UvConstraint, prox_uv};
use crate::signal::construct_x_rank1;

/// Which atoms the objective is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Use the atoms and activations as given.
    Raw,
    /// Project a copy of the atoms onto the feasible set and rescale a copy of
    /// the activations to compensate before evaluating.
    Feasible(UvConstraint),
}

/// `0.5 * ||x - x_hat||^2 + reg * sum(z)`.
pub fn objective(x: ArrayView3<'_, f64>, x_hat: ArrayView3<'_, f64>, z: ArrayView3<'_, f64>, reg: f64) -> f64 {
    let mut residual = 0.0;
    for (&a, &b) in x.iter().zip(x_hat.iter()) {
        let r = a - b;
        residual += r * r;
    }
    0.5 * residual + reg * z.sum()
}

/// Reconstruct `x` from `(z, uv)` and evaluate the objective.
///
/// The caller's arrays are never modified; feasible evaluation works on copies.
pub fn compute_objective(
    x: ArrayView3<'_, f64>,
    z: ArrayView3<'_, f64>,
    uv: ArrayView2<'_, f64>,
    reg: f64,
    evaluation: Evaluation,
) -> f64 {
    let n_channels = x.dim().1;
    match evaluation {
        Evaluation::Raw => {
            let x_hat = construct_x_rank1(z, uv, n_channels);
            objective(x, x_hat.view(), z, reg)
        }
        Evaluation::Feasible(constraint) => {
            let projection = prox_uv(uv, constraint, n_channels);
            let mut z = z.to_owned();
            for (k, mut zk) in z.axis_iter_mut(Axis(0)).enumerate() {
                zk *= projection.norms[k];
            }
            let x_hat = construct_x_rank1(z.view(), projection.uv.view(), n_channels);
            objective(x, x_hat.view(), z.view(), reg)
        }
    }
}
