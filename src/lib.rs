//! Multivariate convolutional dictionary learning with rank-1 atoms.
//!
//! Given trials `X` of shape `(n_trials, n_channels, n_times)`, this crate
//! learns `n_atoms` atoms `u_k v_k^T` (a spatial pattern `u_k` over channels
//! times a waveform `v_k` of `n_times_atom` samples) and non-negative
//! activations `Z` of shape `(n_atoms, n_trials, n_times - n_times_atom + 1)`
//! minimizing
//!
//! ```text
//! 0.5 * ||X - sum_k Z_k * (u_k v_k^T)||^2 + reg * sum(Z)
//! ```
//!
//! How it works (high level):
//! - Draw random atoms and project them onto the feasible set.
//! - Alternate a sparse-code step (`Z` with atoms fixed) and a dictionary step
//!   (atoms with `Z` fixed), recording the objective after each.
//! - Stop on a small decrease, a target objective, or the iteration budget.
//! - Re-fit the final activations by least squares on their support.
//!
//! Example:
//! ```rust,no_run
//! use ndarray::Array3;
//! use rank1_csc::{LearnOptions, learn_d_z_multi};
//!
//! let x = Array3::<f64>::zeros((4, 3, 200));
//! let options = LearnOptions {
//!     n_iter: 20,
//!     random_state: Some(0),
//!     verbose: 0,
//!     ..LearnOptions::default()
//! };
//! let result = learn_d_z_multi(x.view(), 2, 16, &options, None).unwrap();
//! assert_eq!(result.uv.dim(), (2, 3 + 16));
//! ```

mod learn;
mod least_squares;
mod objective;
mod optim;
mod parallel;
mod pattern;
mod projection;
mod report;
mod signal;
mod update_d;
mod update_z;
mod whitening;

pub use learn::{
    LearnError, LearnOptions, LearnResult, LearnStatus, StageError, learn_d_z_multi, learn_d_z_multi_with,
};
pub use least_squares::{LeastSquaresError, support_least_squares};
pub use objective::{Evaluation, compute_objective, objective};
pub use parallel::Workers;
pub use projection::{ParseNameError, Projection, UvConstraint, constraint_norms, prox_uv};
pub use report::{Callback, IterationReport, Reporter, StdoutReporter};
pub use signal::{ShapeError, construct_x_multi, construct_x_rank1, rank1_kernels, valid_length};
pub use update_d::{DSolver, DSolverOptions, DictionaryUpdate, RankOneUpdate, update_uv};
pub use update_z::{ZSolver, ZSolverOptions, update_z_multi};
pub use whitening::{ArModel, WhiteningError, apply_whitening, apply_whitening_uv, whitening};
