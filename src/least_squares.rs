use core::fmt;

use dyn_stack::{GlobalPodBuffer, PodStack, ReborrowMut};
use faer_core::mat;
use faer_core::sparse::SparseColMatRef;
use faer_core::{Conj, Parallelism};
use faer_sparse::qr::{QrSymbolicParams, factorize_symbolic_qr};
use ndarray::{Array3, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

use crate::parallel::Workers;
use crate::pattern::{SupportEntry, SupportPattern};
use crate::signal::{Rank1Operator, ShapeError, trial_activations, trial_signal, valid_length};

/// Relative ridge added to the normal equations so that a rank-deficient
/// support still has a unique solution.
const RIDGE: f64 = 1e-10;

/// Errors while refining activations on their support.
#[derive(Debug)]
pub enum LeastSquaresError {
    /// Input arrays are inconsistent.
    Shape(ShapeError),
    /// faer reported an error during factorization.
    Faer(faer_sparse::FaerError),
    /// Workspace requirement overflowed.
    WorkspaceOverflow,
    /// Workspace allocation failed.
    WorkspaceAlloc,
}

impl fmt::Display for LeastSquaresError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shape(err) => write!(f, "{err}"),
            Self::Faer(err) => write!(f, "faer error: {err:?}"),
            Self::WorkspaceOverflow => write!(f, "workspace size overflow"),
            Self::WorkspaceAlloc => write!(f, "workspace allocation failed"),
        }
    }
}

impl std::error::Error for LeastSquaresError {}

impl From<ShapeError> for LeastSquaresError {
    fn from(err: ShapeError) -> Self {
        Self::Shape(err)
    }
}

/// Re-fit the amplitudes of the non-zero activations by least squares.
///
/// For each trial the support (the non-zero entries of `z`) is kept fixed and
/// `||x_i - A_S z_S||^2` is minimized without sign constraint. Entries outside
/// the support stay zero.
pub fn support_least_squares(
    x: ArrayView3<'_, f64>,
    uv: ArrayView2<'_, f64>,
    z: ArrayView3<'_, f64>,
    workers: &Workers,
) -> Result<Array3<f64>, LeastSquaresError> {
    let (n_trials, n_channels, n_times) = x.dim();
    let n_atoms = uv.nrows();
    let n_times_atom = uv.ncols().saturating_sub(n_channels);
    let n_times_valid = valid_length(n_times, n_times_atom);
    ShapeError::check("z", &[n_atoms, n_trials, n_times_valid], z.shape())?;

    let op = Rank1Operator::new(uv, n_channels, n_times_valid);
    let refined: Vec<Vec<f64>> = workers.install(|| {
        (0..n_trials)
            .into_par_iter()
            .map(|i| refine_trial(&op, &trial_signal(x, i), &trial_activations(z, i)))
            .collect::<Result<_, _>>()
    })?;

    let mut out = Array3::zeros((n_atoms, n_trials, n_times_valid));
    for (i, zi) in refined.iter().enumerate() {
        for (dst, &src) in out.index_axis_mut(Axis(1), i).iter_mut().zip(zi.iter()) {
            *dst = src;
        }
    }
    Ok(out)
}

fn refine_trial(op: &Rank1Operator<'_>, target: &[f64], zi: &[f64]) -> Result<Vec<f64>, LeastSquaresError> {
    let n_times_valid = op.n_times_valid();
    let n_times = op.n_times();
    let mut refined = vec![0.0; zi.len()];
    let support: Vec<SupportEntry> = zi
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v != 0.0)
        .map(|(j, _)| SupportEntry {
            atom: j / n_times_valid,
            time: j % n_times_valid,
        })
        .collect();
    if support.is_empty() {
        return Ok(refined);
    }

    let pattern = SupportPattern::new(op.n_channels(), n_times, op.n_times_atom(), &support);
    let parallelism = Parallelism::None;

    let mut values = vec![0.0; pattern.row_indices().len()];
    let mut max_col_norm = 0.0_f64;
    for (col, entry) in support.iter().enumerate() {
        let start = pattern.col_ptrs()[col];
        let end = pattern.diag_positions()[col];
        let mut norm = 0.0;
        for idx in start..end {
            let row = pattern.row_indices()[idx];
            let channel = row / n_times;
            let lag = row % n_times - entry.time;
            let value = op.kernel(entry.atom, channel, lag);
            values[idx] = value;
            norm += value * value;
        }
        max_col_norm = max_col_norm.max(norm);
    }
    let diag = if max_col_norm > 0.0 {
        (RIDGE * max_col_norm).sqrt()
    } else {
        1.0
    };
    for &pos in pattern.diag_positions() {
        values[pos] = diag;
    }

    let symbolic_qr = factorize_symbolic_qr(pattern.as_symbolic(), QrSymbolicParams::default())
        .map_err(LeastSquaresError::Faer)?;
    let factor_req = symbolic_qr
        .factorize_numeric_qr_req::<f64>(parallelism)
        .map_err(|_| LeastSquaresError::WorkspaceOverflow)?;
    let solve_req = symbolic_qr
        .solve_in_place_req::<f64>(1, parallelism)
        .map_err(|_| LeastSquaresError::WorkspaceOverflow)?;
    let req = factor_req
        .try_or(solve_req)
        .map_err(|_| LeastSquaresError::WorkspaceOverflow)?;
    let mut qr_stack = GlobalPodBuffer::try_new(req).map_err(|_| LeastSquaresError::WorkspaceAlloc)?;
    let mut qr_indices = vec![0usize; symbolic_qr.len_indices()];
    let mut qr_values = vec![0.0; symbolic_qr.len_values()];

    let a = SparseColMatRef::<'_, usize, f64>::new(pattern.as_symbolic(), values.as_slice());
    let m = pattern.signal_rows();
    let n = pattern.ncols();
    let mut rhs = vec![0.0; m + n];
    rhs[..m].copy_from_slice(target);

    let mut stack = PodStack::new(&mut qr_stack);
    let qr = symbolic_qr.factorize_numeric_qr::<f64>(
        &mut qr_indices,
        &mut qr_values,
        a,
        parallelism,
        stack.rb_mut(),
    );
    let mut rhs_mat = mat::from_column_major_slice_mut::<f64>(&mut rhs, m + n, 1);
    let mut stack = PodStack::new(&mut qr_stack);
    qr.solve_in_place_with_conj(Conj::No, rhs_mat.rb_mut(), parallelism, stack.rb_mut());

    // The least-squares solution is the first n entries of the solved system.
    for (col, entry) in support.iter().enumerate() {
        refined[entry.atom * n_times_valid + entry.time] = rhs[col];
    }
    Ok(refined)
}
