use core::fmt;

use ndarray::{Array3, ArrayView2, ArrayView3, Axis, s};

/// An array did not have the shape an operation expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeError {
    pub what: &'static str,
    pub expected: Vec<usize>,
    pub actual: Vec<usize>,
}

impl ShapeError {
    pub(crate) fn check(what: &'static str, expected: &[usize], actual: &[usize]) -> Result<(), Self> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self {
                what,
                expected: expected.to_vec(),
                actual: actual.to_vec(),
            })
        }
    }
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} has shape {:?}, expected {:?}",
            self.what, self.actual, self.expected
        )
    }
}

impl std::error::Error for ShapeError {}

/// Length of a "valid" convolution output: `n_times - n_times_atom + 1`.
///
/// Returns 0 when the atom is longer than the signal.
pub fn valid_length(n_times: usize, n_times_atom: usize) -> usize {
    (n_times + 1).saturating_sub(n_times_atom)
}

/// Expand rank-1 atoms `[u_k, v_k]` into full kernels `D[k, c, s] = u_k[c] v_k[s]`.
pub fn rank1_kernels(uv: ArrayView2<'_, f64>, n_channels: usize) -> Array3<f64> {
    let n_atoms = uv.nrows();
    let n_times_atom = uv.ncols() - n_channels;
    let u = uv.slice(s![.., ..n_channels]);
    let v = uv.slice(s![.., n_channels..]);
    Array3::from_shape_fn((n_atoms, n_channels, n_times_atom), |(k, c, t)| {
        u[[k, c]] * v[[k, t]]
    })
}

/// Reconstruct signals from activations and kernels.
///
/// `z` has shape `(n_atoms, n_trials, n_times_valid)`, `d` has shape
/// `(n_atoms, n_channels, n_times_atom)`; the result has shape
/// `(n_trials, n_channels, n_times_valid + n_times_atom - 1)`.
pub fn construct_x_multi(z: ArrayView3<'_, f64>, d: ArrayView3<'_, f64>) -> Array3<f64> {
    let (n_atoms, n_trials, n_times_valid) = z.dim();
    let (_, n_channels, n_times_atom) = d.dim();
    let n_times = n_times_valid + n_times_atom - 1;
    let mut x_hat = Array3::zeros((n_trials, n_channels, n_times));
    for k in 0..n_atoms {
        for i in 0..n_trials {
            for t in 0..n_times_valid {
                let zt = z[[k, i, t]];
                if zt == 0.0 {
                    continue;
                }
                for c in 0..n_channels {
                    for s in 0..n_times_atom {
                        x_hat[[i, c, t + s]] += zt * d[[k, c, s]];
                    }
                }
            }
        }
    }
    x_hat
}

/// Reconstruct signals directly from rank-1 atoms, without forming kernels.
pub fn construct_x_rank1(z: ArrayView3<'_, f64>, uv: ArrayView2<'_, f64>, n_channels: usize) -> Array3<f64> {
    let (_, n_trials, n_times_valid) = z.dim();
    let op = Rank1Operator::new(uv, n_channels, n_times_valid);
    let mut x_hat = Array3::zeros((n_trials, n_channels, op.n_times()));
    let mut scratch = vec![0.0; op.n_times()];
    let mut out = vec![0.0; op.output_len()];
    for (i, mut trial) in x_hat.axis_iter_mut(Axis(0)).enumerate() {
        let zi = trial_activations(z, i);
        op.apply(&zi, &mut out, &mut scratch);
        for (dst, &src) in trial.iter_mut().zip(out.iter()) {
            *dst = src;
        }
    }
    x_hat
}

/// Copy the activations of trial `i` into a flat, row-major `(n_atoms, n_times_valid)` buffer.
pub(crate) fn trial_activations(z: ArrayView3<'_, f64>, i: usize) -> Vec<f64> {
    z.index_axis(Axis(1), i).iter().copied().collect()
}

/// Copy trial `i` into a flat, row-major `(n_channels, n_times)` buffer.
pub(crate) fn trial_signal(x: ArrayView3<'_, f64>, i: usize) -> Vec<f64> {
    x.index_axis(Axis(0), i).iter().copied().collect()
}

/// Convolution with rank-1 atoms for a single trial.
///
/// Maps activations `z` (row-major `n_atoms × n_times_valid`) to a signal
/// (row-major `n_channels × n_times`).
pub(crate) struct Rank1Operator<'a> {
    u: ArrayView2<'a, f64>,
    v: ArrayView2<'a, f64>,
    n_times_valid: usize,
}

impl<'a> Rank1Operator<'a> {
    pub(crate) fn new(uv: ArrayView2<'a, f64>, n_channels: usize, n_times_valid: usize) -> Self {
        Self {
            u: uv.slice_move(s![.., ..n_channels]),
            v: uv.slice_move(s![.., n_channels..]),
            n_times_valid,
        }
    }

    pub(crate) fn n_atoms(&self) -> usize {
        self.u.nrows()
    }

    pub(crate) fn n_channels(&self) -> usize {
        self.u.ncols()
    }

    pub(crate) fn n_times_atom(&self) -> usize {
        self.v.ncols()
    }

    pub(crate) fn n_times_valid(&self) -> usize {
        self.n_times_valid
    }

    pub(crate) fn n_times(&self) -> usize {
        self.n_times_valid + self.n_times_atom() - 1
    }

    /// Length of an activation buffer.
    pub(crate) fn input_len(&self) -> usize {
        self.n_atoms() * self.n_times_valid
    }

    /// Length of a signal buffer.
    pub(crate) fn output_len(&self) -> usize {
        self.n_channels() * self.n_times()
    }

    /// Kernel value `u_k[c] * v_k[s]`.
    pub(crate) fn kernel(&self, k: usize, c: usize, s: usize) -> f64 {
        self.u[[k, c]] * self.v[[k, s]]
    }

    /// `out = A z`; `scratch` must hold `n_times` values.
    pub(crate) fn apply(&self, z: &[f64], out: &mut [f64], scratch: &mut [f64]) {
        let n_times = self.n_times();
        let n_tv = self.n_times_valid;
        out.fill(0.0);
        for k in 0..self.n_atoms() {
            let y = &mut scratch[..n_times];
            y.fill(0.0);
            let zk = &z[k * n_tv..(k + 1) * n_tv];
            let vk = self.v.row(k);
            let mut any = false;
            for (t, &zt) in zk.iter().enumerate() {
                if zt == 0.0 {
                    continue;
                }
                any = true;
                for (s, &vs) in vk.iter().enumerate() {
                    y[t + s] += zt * vs;
                }
            }
            if !any {
                continue;
            }
            for c in 0..self.n_channels() {
                let uc = self.u[[k, c]];
                if uc == 0.0 {
                    continue;
                }
                let row = &mut out[c * n_times..(c + 1) * n_times];
                for (o, &yt) in row.iter_mut().zip(y.iter()) {
                    *o += uc * yt;
                }
            }
        }
    }

    /// `out = A^T x`; `scratch` must hold `n_times` values.
    pub(crate) fn adjoint(&self, x: &[f64], out: &mut [f64], scratch: &mut [f64]) {
        let n_times = self.n_times();
        let n_tv = self.n_times_valid;
        for k in 0..self.n_atoms() {
            let w = &mut scratch[..n_times];
            w.fill(0.0);
            for c in 0..self.n_channels() {
                let uc = self.u[[k, c]];
                if uc == 0.0 {
                    continue;
                }
                let row = &x[c * n_times..(c + 1) * n_times];
                for (wt, &xt) in w.iter_mut().zip(row.iter()) {
                    *wt += uc * xt;
                }
            }
            let vk = self.v.row(k);
            for t in 0..n_tv {
                let mut sum = 0.0;
                for (s, &vs) in vk.iter().enumerate() {
                    sum += w[t + s] * vs;
                }
                out[k * n_tv + t] = sum;
            }
        }
    }

    /// Power-iteration estimate of the largest eigenvalue of `A^T A`.
    pub(crate) fn lipschitz(&self, n_iter: usize) -> f64 {
        let n = self.input_len();
        if n == 0 {
            return 0.0;
        }
        let mut b = vec![1.0 / (n as f64).sqrt(); n];
        let mut ab = vec![0.0; self.output_len()];
        let mut atab = vec![0.0; n];
        let mut scratch = vec![0.0; self.n_times()];
        let mut eig = 0.0;
        for _ in 0..n_iter {
            self.apply(&b, &mut ab, &mut scratch);
            self.adjoint(&ab, &mut atab, &mut scratch);
            let norm = l2_norm(&atab);
            if norm == 0.0 {
                return 0.0;
            }
            eig = norm;
            for (bi, &ai) in b.iter_mut().zip(atab.iter()) {
                *bi = ai / norm;
            }
        }
        eig
    }
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

pub(crate) fn l2_norm(x: &[f64]) -> f64 {
    dot(x, x).sqrt()
}

pub(crate) fn max_abs(x: &[f64]) -> f64 {
    let mut max = 0.0;
    for &v in x {
        let v = v.abs();
        if v > max {
            max = v;
        }
    }
    max
}
