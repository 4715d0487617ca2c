//! Auto-regressive whitening of multichannel signals.
//!
//! An AR model is fitted to the mean spectrum of every channel of every
//! trial, and each signal is filtered with the AR polynomial so that its
//! spectrum flattens. Learning atoms on whitened data and whitening the
//! learned atoms with the same model keeps the two consistent.

use core::f64::consts::PI;
use core::fmt;

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

/// Longest autocorrelation lag used to estimate the spectrum.
const BLOCK_LENGTH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum WhiteningError {
    /// The data has a zero-sized dimension.
    EmptyData { shape: [usize; 3] },
    /// The AR order exceeds the longest usable lag.
    OrderTooLarge { ordar: usize, max_order: usize },
}

impl fmt::Display for WhiteningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyData { shape } => write!(f, "data has an empty dimension: {shape:?}"),
            Self::OrderTooLarge { ordar, max_order } => {
                write!(f, "AR order {ordar} exceeds the maximum usable order {max_order}")
            }
        }
    }
}

impl std::error::Error for WhiteningError {}

/// Fitted AR model `x_t + a_1 x_{t-1} + ... + a_p x_{t-p} = e_t`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArModel {
    /// `a_1..a_p`.
    pub coefficients: Vec<f64>,
    /// Variance of the innovation `e_t`.
    pub noise_variance: f64,
    /// Whether the filter is applied forward and backward.
    pub zero_phase: bool,
}

impl ArModel {
    /// `[1, a_1, ..., a_p]`.
    pub fn polynomial(&self) -> Vec<f64> {
        let mut poly = Vec::with_capacity(self.coefficients.len() + 1);
        poly.push(1.0);
        poly.extend_from_slice(&self.coefficients);
        poly
    }

    /// Filter one signal with the AR polynomial, keeping its length.
    pub fn filter(&self, signal: &[f64]) -> Vec<f64> {
        let poly = self.polynomial();
        if self.zero_phase {
            let mut tmp = convolve_same(signal, &poly);
            tmp.reverse();
            let mut out = convolve_same(&tmp, &poly);
            out.reverse();
            out
        } else {
            convolve_same(signal, &poly)
        }
    }
}

/// Fit an AR(`ordar`) model to `x` and return it with the whitened signals.
///
/// With `zero_phase` the model is fitted to the square root of the spectrum
/// and applied forward then backward, so the combined filter has no phase
/// shift. The whitened signals are tapered with a Tukey window to suppress
/// edge artifacts.
pub fn whitening(
    x: ArrayView3<'_, f64>,
    ordar: usize,
    zero_phase: bool,
) -> Result<(ArModel, Array3<f64>), WhiteningError> {
    let (n_trials, n_channels, n_times) = x.dim();
    if n_trials == 0 || n_channels == 0 || n_times == 0 {
        return Err(WhiteningError::EmptyData {
            shape: [n_trials, n_channels, n_times],
        });
    }
    let max_lag = BLOCK_LENGTH.min(n_times) - 1;
    if ordar > max_lag {
        return Err(WhiteningError::OrderTooLarge {
            ordar,
            max_order: max_lag,
        });
    }

    let autocorr = mean_autocorrelation(x, max_lag);
    let target = if zero_phase {
        sqrt_spectrum_autocorrelation(&autocorr, ordar)
    } else {
        autocorr[..=ordar].to_vec()
    };
    let (coefficients, noise_variance) = levinson_durbin(&target, ordar);
    let model = ArModel {
        coefficients,
        noise_variance,
        zero_phase,
    };

    let mut white = apply_whitening(&model, x);
    let window = tukey(n_times, 3.0 / n_times as f64);
    for mut signal in white.lanes_mut(Axis(2)) {
        for (value, &w) in signal.iter_mut().zip(window.iter()) {
            *value *= w;
        }
    }
    log::debug!(
        "whitening: AR({ordar}) fitted on {} signals, innovation variance {:.3e}",
        n_trials * n_channels,
        model.noise_variance
    );
    Ok((model, white))
}

/// Filter every channel of every trial with `model`.
pub fn apply_whitening(model: &ArModel, x: ArrayView3<'_, f64>) -> Array3<f64> {
    let mut out = Array3::zeros(x.raw_dim());
    for (src, mut dst) in x.lanes(Axis(2)).into_iter().zip(out.lanes_mut(Axis(2))) {
        let filtered = model.filter(&src.to_vec());
        for (d, s) in dst.iter_mut().zip(filtered) {
            *d = s;
        }
    }
    out
}

/// Filter the temporal part of each rank-1 atom; the spatial part is copied.
pub fn apply_whitening_uv(model: &ArModel, uv: ArrayView2<'_, f64>, n_channels: usize) -> Array2<f64> {
    let mut out = uv.to_owned();
    for mut atom in out.rows_mut() {
        let v: Vec<f64> = atom.iter().skip(n_channels).copied().collect();
        let filtered = model.filter(&v);
        for (d, s) in atom.iter_mut().skip(n_channels).zip(filtered) {
            *d = s;
        }
    }
    out
}

/// Biased autocorrelation averaged over every signal, lags `0..=max_lag`.
fn mean_autocorrelation(x: ArrayView3<'_, f64>, max_lag: usize) -> Vec<f64> {
    let n_times = x.dim().2;
    let mut r = vec![0.0; max_lag + 1];
    let mut n_signals = 0usize;
    for signal in x.lanes(Axis(2)) {
        let signal = signal.to_vec();
        for (lag, r_lag) in r.iter_mut().enumerate() {
            let mut sum = 0.0;
            for t in 0..n_times - lag {
                sum += signal[t] * signal[t + lag];
            }
            *r_lag += sum / n_times as f64;
        }
        n_signals += 1;
    }
    for value in &mut r {
        *value /= n_signals as f64;
    }
    r
}

/// Autocorrelation (lags `0..=ordar`) of the square root of the Bartlett
/// smoothed spectrum of `autocorr`.
fn sqrt_spectrum_autocorrelation(autocorr: &[f64], ordar: usize) -> Vec<f64> {
    let max_lag = autocorr.len() - 1;
    let n_freqs = 2 * (max_lag + 1);
    let weight = |lag: usize| 1.0 - lag as f64 / (max_lag + 1) as f64;
    let spectrum: Vec<f64> = (0..n_freqs)
        .map(|j| {
            let mut p = autocorr[0];
            for (lag, &r) in autocorr.iter().enumerate().skip(1) {
                p += 2.0 * weight(lag) * r * (2.0 * PI * (j * lag) as f64 / n_freqs as f64).cos();
            }
            p.max(0.0).sqrt()
        })
        .collect();
    (0..=ordar)
        .map(|lag| {
            let mut sum = 0.0;
            for (j, &p) in spectrum.iter().enumerate() {
                sum += p * (2.0 * PI * (j * lag) as f64 / n_freqs as f64).cos();
            }
            sum / n_freqs as f64
        })
        .collect()
}

/// Solve the Yule-Walker equations for `order` coefficients.
///
/// Returns `(a_1..a_p, innovation variance)`. A zero-energy input gives
/// the identity filter.
fn levinson_durbin(r: &[f64], order: usize) -> (Vec<f64>, f64) {
    let mut a = vec![0.0; order];
    let mut err = r[0];
    if err <= 0.0 {
        return (a, 0.0);
    }
    let mut prev = vec![0.0; order];
    for k in 0..order {
        let mut acc = r[k + 1];
        for j in 0..k {
            acc += a[j] * r[k - j];
        }
        let reflection = -acc / err;
        prev[..k].copy_from_slice(&a[..k]);
        a[k] = reflection;
        for j in 0..k {
            a[j] = prev[j] + reflection * prev[k - 1 - j];
        }
        err *= 1.0 - reflection * reflection;
        if err <= 0.0 {
            err = 0.0;
            break;
        }
    }
    (a, err)
}

/// Centered part of the full convolution, same length as `signal`.
fn convolve_same(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
    let n = signal.len();
    let offset = (kernel.len() - 1) / 2;
    (0..n)
        .map(|i| {
            let j = i + offset;
            let mut sum = 0.0;
            for (k, &c) in kernel.iter().enumerate() {
                if j >= k && j - k < n {
                    sum += c * signal[j - k];
                }
            }
            sum
        })
        .collect()
}

/// Tapered cosine window of `len` samples; `alpha` is the tapered fraction.
fn tukey(len: usize, alpha: f64) -> Vec<f64> {
    if len <= 1 {
        return vec![1.0; len];
    }
    if alpha <= 0.0 {
        return vec![1.0; len];
    }
    let alpha = alpha.min(1.0);
    let span = alpha * (len - 1) as f64;
    let width = (span / 2.0).floor() as usize;
    (0..len)
        .map(|n| {
            let n_f = n as f64;
            if n <= width {
                0.5 * (1.0 + (PI * (-1.0 + 2.0 * n_f / span)).cos())
            } else if n >= len - width - 1 {
                0.5 * (1.0 + (PI * (-2.0 / alpha + 1.0 + 2.0 * n_f / span)).cos())
            } else {
                1.0
            }
        })
        .collect()
}
