use core::fmt;
use std::io::Write;
use std::time::Instant;

use ndarray::{Array2, Array3, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::ThreadPoolBuildError;

use crate::least_squares::{LeastSquaresError, support_least_squares};
use crate::objective::{Evaluation, compute_objective};
use crate::parallel::Workers;
use crate::projection::{UvConstraint, prox_uv};
use crate::report::{Callback, IterationReport, Reporter, StdoutReporter, emit_line, format_seconds};
use crate::signal::{ShapeError, valid_length};
use crate::update_d::{DSolver, DSolverOptions, DictionaryUpdate, RankOneUpdate};
use crate::update_z::{ZSolver, ZSolverOptions, update_z_multi};

/// Error type returned by user-supplied stages and callbacks.
pub type StageError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors while configuring or running a learning run.
#[derive(Debug)]
pub enum LearnError {
    /// The data has a zero-sized dimension.
    EmptyData { shape: [usize; 3] },
    /// `n_atoms` is zero.
    NoAtoms,
    /// The atom support is zero or longer than the trials.
    InvalidAtomLength { n_times_atom: usize, n_times: usize },
    /// A scalar option is out of range.
    InvalidParameter { name: &'static str, value: f64 },
    /// An array does not have the expected shape.
    Shape(ShapeError),
    /// The initial activations contain non-finite entries.
    InvalidInitialActivations,
    /// The worker pool could not be built.
    ThreadPool(ThreadPoolBuildError),
    /// The dictionary update failed.
    Dictionary(StageError),
    /// The per-iteration callback asked to stop.
    Callback(StageError),
    /// The final least-squares refinement failed.
    LeastSquares(LeastSquaresError),
}

impl fmt::Display for LearnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyData { shape } => write!(f, "data has an empty dimension: {shape:?}"),
            Self::NoAtoms => write!(f, "n_atoms must be at least 1"),
            Self::InvalidAtomLength { n_times_atom, n_times } => {
                write!(f, "n_times_atom={n_times_atom} must be in 1..={n_times}")
            }
            Self::InvalidParameter { name, value } => write!(f, "invalid value for {name}: {value}"),
            Self::Shape(err) => write!(f, "{err}"),
            Self::InvalidInitialActivations => {
                write!(f, "initial activations must be finite")
            }
            Self::ThreadPool(err) => write!(f, "failed to build worker pool: {err}"),
            Self::Dictionary(err) => write!(f, "dictionary update failed: {err}"),
            Self::Callback(err) => write!(f, "callback failed: {err}"),
            Self::LeastSquares(err) => write!(f, "least-squares refinement failed: {err}"),
        }
    }
}

impl std::error::Error for LearnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Shape(err) => Some(err),
            Self::ThreadPool(err) => Some(err),
            Self::Dictionary(err) | Self::Callback(err) => Some(err.as_ref()),
            Self::LeastSquares(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ShapeError> for LearnError {
    fn from(err: ShapeError) -> Self {
        Self::Shape(err)
    }
}

impl From<LeastSquaresError> for LearnError {
    fn from(err: LeastSquaresError) -> Self {
        Self::LeastSquares(err)
    }
}

/// Options controlling a learning run.
#[derive(Debug, Clone)]
pub struct LearnOptions {
    /// Weight of the L1 penalty on the activations.
    pub reg: f64,
    /// Maximum number of outer iterations.
    pub n_iter: usize,
    /// Seed for the atom and warm-start draws; `None` seeds from the OS.
    pub random_state: Option<u64>,
    /// Worker threads; `0` uses one per core.
    pub n_jobs: usize,
    pub solver_z: ZSolver,
    pub solver_z_options: ZSolverOptions,
    pub solver_d: DSolver,
    pub solver_d_options: DSolverOptions,
    pub uv_constraint: UvConstraint,
    /// Stop when the dictionary step decreases the objective by less than this.
    pub eps: f64,
    /// Stop once the objective falls to this value.
    pub stopping_pobj: Option<f64>,
    /// Initial atoms, `(n_atoms, n_channels + n_times_atom)`.
    pub uv_init: Option<Array2<f64>>,
    /// Initial activations, `(n_atoms, n_trials, n_times_valid)`. Negative
    /// entries, as left by the support refinement of a previous run, start at zero.
    pub z_init: Option<Array3<f64>>,
    /// Re-fit the final activations by least squares on their support.
    pub refine_support: bool,
    /// `0` silent, `1` progress dots, more for per-iteration lines and a summary table.
    pub verbose: usize,
}

impl Default for LearnOptions {
    fn default() -> Self {
        Self {
            reg: 0.1,
            n_iter: 60,
            random_state: None,
            n_jobs: 1,
            solver_z: ZSolver::default(),
            solver_z_options: ZSolverOptions::default(),
            solver_d: DSolver::default(),
            solver_d_options: DSolverOptions::default(),
            uv_constraint: UvConstraint::default(),
            eps: 1e-10,
            stopping_pobj: None,
            uv_init: None,
            z_init: None,
            refine_support: true,
            verbose: 10,
        }
    }
}

/// Why the outer loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnStatus {
    /// The dictionary step decreased the objective by less than `eps`.
    Converged,
    /// The objective reached `stopping_pobj`.
    ReachedTarget,
    /// All `n_iter` iterations ran.
    MaxIterations,
    /// The sparse-code stage returned only zeros.
    AllActivationsZero,
}

/// Output of a learning run: the objective trace and the final atoms and activations.
#[derive(Debug, Clone)]
pub struct LearnResult {
    /// Objective after initialization and after every half-step.
    pub pobj: Vec<f64>,
    /// Seconds spent in each half-step, aligned with `pobj`.
    pub times: Vec<f64>,
    pub uv: Array2<f64>,
    pub z: Array3<f64>,
    pub status: LearnStatus,
    /// Completed outer iterations.
    pub iterations: usize,
}

/// Learn rank-1 atoms and sparse activations from `x` by alternating minimization.
///
/// `x` has shape `(n_trials, n_channels, n_times)`. Each outer iteration
/// updates the activations with the atoms fixed, then the atoms with the
/// activations fixed, recording the objective after both half-steps.
/// `callback` is invoked after every complete iteration.
pub fn learn_d_z_multi(
    x: ArrayView3<'_, f64>,
    n_atoms: usize,
    n_times_atom: usize,
    options: &LearnOptions,
    callback: Option<&mut dyn Callback>,
) -> Result<LearnResult, LearnError> {
    learn_d_z_multi_with(x, n_atoms, n_times_atom, &mut RankOneUpdate, options, callback)
}

/// Like [`learn_d_z_multi`], with a caller-supplied dictionary update.
pub fn learn_d_z_multi_with(
    x: ArrayView3<'_, f64>,
    n_atoms: usize,
    n_times_atom: usize,
    func_d: &mut dyn DictionaryUpdate,
    options: &LearnOptions,
    mut callback: Option<&mut dyn Callback>,
) -> Result<LearnResult, LearnError> {
    validate(x, n_atoms, n_times_atom, options)?;
    let (n_trials, n_channels, n_times) = x.dim();
    let n_times_valid = valid_length(n_times, n_times_atom);
    let start_time = (options.verbose > 0).then(Instant::now);

    let mut rng = match options.random_state {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let uv_raw = match &options.uv_init {
        Some(uv) => uv.clone(),
        None => Array2::from_shape_fn((n_atoms, n_channels + n_times_atom), |_| {
            rng.sample::<f64, _>(StandardNormal)
        }),
    };
    let projection = prox_uv(uv_raw.view(), options.uv_constraint, n_channels);
    let mut uv = projection.uv;
    let b_hat_0: Vec<f64> = (0..n_atoms * (n_channels + n_times_atom))
        .map(|_| rng.sample::<f64, _>(StandardNormal))
        .collect();

    let mut z = match &options.z_init {
        Some(z_init) => {
            // Keep the warm start's reconstruction when the atoms were shrunk.
            let mut z = z_init.clone();
            for (k, mut zk) in z.axis_iter_mut(Axis(0)).enumerate() {
                zk *= projection.norms[k];
            }
            let negative = z.iter().filter(|&&v| v < 0.0).count();
            if negative > 0 {
                log::debug!("clamping {negative} negative initial activations to zero");
                z.mapv_inplace(|v| v.max(0.0));
            }
            z
        }
        None => Array3::zeros((n_atoms, n_trials, n_times_valid)),
    };

    let workers = Workers::new(options.n_jobs).map_err(LearnError::ThreadPool)?;
    let mut reporter = (options.verbose > 1).then(StdoutReporter::new);

    let mut pobj = vec![compute_objective(x, z.view(), uv.view(), options.reg, Evaluation::Raw)];
    let mut times = vec![0.0];
    let mut status = LearnStatus::MaxIterations;
    let mut iterations = 0;

    for ii in 0..options.n_iter {
        if options.verbose == 1 {
            print!(".");
            std::io::stdout().flush().ok();
        }

        // A cold start with the full penalty tends to zero every activation.
        let reg = if ii == 0 && options.z_init.is_none() {
            options.reg / 100.0
        } else {
            options.reg
        };

        let stage = Instant::now();
        z = update_z_multi(
            x,
            uv.view(),
            reg,
            z.view(),
            &workers,
            options.solver_z,
            &options.solver_z_options,
        )?;
        let time_z = stage.elapsed().as_secs_f64();

        if z.iter().all(|&v| v == 0.0) {
            log::warn!("regularization parameter `reg` is too large and all the activations are zero; no atom has been learned");
            status = LearnStatus::AllActivationsZero;
            break;
        }

        pobj.push(compute_objective(x, z.view(), uv.view(), options.reg, Evaluation::Raw));
        times.push(time_z);

        let stage = Instant::now();
        let next_uv = func_d
            .update(
                x,
                z.view(),
                uv.view(),
                &b_hat_0,
                options.solver_d,
                options.uv_constraint,
                &options.solver_d_options,
            )
            .map_err(LearnError::Dictionary)?;
        ShapeError::check("uv", uv.shape(), next_uv.shape())?;
        uv = next_uv;
        let time_d = stage.elapsed().as_secs_f64();

        pobj.push(compute_objective(x, z.view(), uv.view(), options.reg, Evaluation::Raw));
        times.push(time_d);
        iterations = ii + 1;

        if let Some(reporter) = reporter.as_mut() {
            let n = pobj.len();
            let sparsity = z.iter().filter(|&&v| v != 0.0).count() as f64 / z.len() as f64;
            emit_line(&format!(
                "[{ii}/{}] objective (z) {:.6e} (sparsity {sparsity:.3e}) objective (d) {:.6e}",
                options.n_iter,
                pobj[n - 2],
                pobj[n - 1]
            ));
            reporter.on_iteration(&IterationReport {
                iteration: ii,
                objective_z: pobj[n - 2],
                objective_d: pobj[n - 1],
                time_z,
                time_d,
                sparsity,
            });
        }

        if let Some(callback) = callback.as_deref_mut() {
            callback
                .on_iteration(x, uv.view(), z.view(), options.reg)
                .map_err(LearnError::Callback)?;
        }

        let n = pobj.len();
        if pobj[n - 2] - pobj[n - 1] < options.eps {
            status = LearnStatus::Converged;
            break;
        }
        if let Some(target) = options.stopping_pobj {
            if pobj[n - 1] <= target {
                status = LearnStatus::ReachedTarget;
                break;
            }
        }
    }

    if options.verbose == 1 && options.n_iter > 0 {
        println!();
    }
    if let Some(reporter) = reporter.as_mut() {
        reporter.on_finish();
    }

    if options.refine_support {
        z = support_least_squares(x, uv.view(), z.view(), &workers)?;
    }

    if let Some(start) = start_time {
        let elapsed = format_seconds(start.elapsed().as_secs_f64());
        emit_line(&format!("done ({elapsed}, {iterations} iterations, {status:?})"));
    }

    Ok(LearnResult {
        pobj,
        times,
        uv,
        z,
        status,
        iterations,
    })
}

fn validate(
    x: ArrayView3<'_, f64>,
    n_atoms: usize,
    n_times_atom: usize,
    options: &LearnOptions,
) -> Result<(), LearnError> {
    let (n_trials, n_channels, n_times) = x.dim();
    if n_trials == 0 || n_channels == 0 || n_times == 0 {
        return Err(LearnError::EmptyData {
            shape: [n_trials, n_channels, n_times],
        });
    }
    if n_atoms == 0 {
        return Err(LearnError::NoAtoms);
    }
    if n_times_atom == 0 || n_times_atom > n_times {
        return Err(LearnError::InvalidAtomLength { n_times_atom, n_times });
    }
    if !(options.reg.is_finite() && options.reg >= 0.0) {
        return Err(LearnError::InvalidParameter {
            name: "reg",
            value: options.reg,
        });
    }
    if !(options.eps.is_finite() && options.eps > 0.0) {
        return Err(LearnError::InvalidParameter {
            name: "eps",
            value: options.eps,
        });
    }
    if let Some(uv) = &options.uv_init {
        ShapeError::check("uv_init", &[n_atoms, n_channels + n_times_atom], uv.shape())?;
    }
    if let Some(z) = &options.z_init {
        ShapeError::check(
            "z_init",
            &[n_atoms, n_trials, valid_length(n_times, n_times_atom)],
            z.shape(),
        )?;
        if z.iter().any(|v| !v.is_finite()) {
            return Err(LearnError::InvalidInitialActivations);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> LearnOptions {
        LearnOptions {
            verbose: 0,
            random_state: Some(0),
            ..LearnOptions::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let options = LearnOptions::default();
        assert_eq!(options.reg, 0.1);
        assert_eq!(options.n_iter, 60);
        assert_eq!(options.n_jobs, 1);
        assert_eq!(options.solver_z, ZSolver::Lbfgs);
        assert_eq!(options.solver_d, DSolver::Alternate);
        assert_eq!(options.uv_constraint, UvConstraint::Separate);
        assert_eq!(options.eps, 1e-10);
        assert!(options.refine_support);
        assert_eq!(options.verbose, 10);
    }

    #[test]
    fn validation_rejects_bad_configuration() {
        let x = Array3::<f64>::zeros((2, 3, 10));
        let v = x.view();
        assert!(matches!(validate(v, 0, 3, &quiet()), Err(LearnError::NoAtoms)));
        assert!(matches!(
            validate(v, 1, 11, &quiet()),
            Err(LearnError::InvalidAtomLength { n_times_atom: 11, n_times: 10 })
        ));
        assert!(matches!(
            validate(v, 1, 0, &quiet()),
            Err(LearnError::InvalidAtomLength { .. })
        ));
        let bad_reg = LearnOptions { reg: f64::NAN, ..quiet() };
        assert!(matches!(
            validate(v, 1, 3, &bad_reg),
            Err(LearnError::InvalidParameter { name: "reg", .. })
        ));
        let bad_eps = LearnOptions { eps: 0.0, ..quiet() };
        assert!(matches!(
            validate(v, 1, 3, &bad_eps),
            Err(LearnError::InvalidParameter { name: "eps", .. })
        ));
        let empty = Array3::<f64>::zeros((0, 3, 10));
        assert!(matches!(
            validate(empty.view(), 1, 3, &quiet()),
            Err(LearnError::EmptyData { .. })
        ));
    }

    #[test]
    fn validation_accepts_zero_reg_and_full_length_atoms() {
        let x = Array3::<f64>::zeros((1, 1, 4));
        let options = LearnOptions { reg: 0.0, ..quiet() };
        assert!(validate(x.view(), 2, 4, &options).is_ok());
    }

    #[test]
    fn validation_checks_initial_arrays() {
        let x = Array3::<f64>::zeros((2, 3, 10));
        let uv_init = LearnOptions {
            uv_init: Some(Array2::zeros((2, 6))),
            ..quiet()
        };
        let err = validate(x.view(), 2, 4, &uv_init).unwrap_err();
        assert!(matches!(err, LearnError::Shape(ShapeError { what: "uv_init", .. })));

        let mut z = Array3::zeros((2, 2, 7));
        z[[1, 0, 3]] = -0.5;
        let signed = LearnOptions {
            z_init: Some(z.clone()),
            ..quiet()
        };
        assert!(validate(x.view(), 2, 4, &signed).is_ok());

        z[[0, 1, 2]] = f64::NAN;
        let not_finite = LearnOptions {
            z_init: Some(z),
            ..quiet()
        };
        assert!(matches!(
            validate(x.view(), 2, 4, &not_finite),
            Err(LearnError::InvalidInitialActivations)
        ));
    }

    #[test]
    fn errors_expose_their_source() {
        let err = LearnError::Callback("stop".into());
        assert_eq!(err.to_string(), "callback failed: stop");
        assert!(std::error::Error::source(&err).is_some());
        assert!(std::error::Error::source(&LearnError::NoAtoms).is_none());
    }
}
