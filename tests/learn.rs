use std::cell::Cell;

use ndarray::{Array2, Array3, ArrayView2, ArrayView3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rank1_csc::{
    Callback, DSolver, DSolverOptions, DictionaryUpdate, Evaluation, LearnError, LearnOptions, LearnResult,
    LearnStatus, RankOneUpdate, StageError, UvConstraint, ZSolver, compute_objective, constraint_norms,
    construct_x_rank1, learn_d_z_multi, learn_d_z_multi_with,
};

const N_CHANNELS: usize = 3;
const N_TIMES_ATOM: usize = 8;

/// Spiky activations of one known atom plus a little noise.
fn simulate(n_trials: usize, n_times: usize, seed: u64) -> (Array3<f64>, Array2<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut uv = Array2::zeros((1, N_CHANNELS + N_TIMES_ATOM));
    let u = [0.8, 0.5, -0.3];
    let u_norm = u.iter().map(|x| x * x).sum::<f64>().sqrt();
    for (c, &value) in u.iter().enumerate() {
        uv[[0, c]] = value / u_norm;
    }
    let v: Vec<f64> = (0..N_TIMES_ATOM)
        .map(|s| (core::f64::consts::PI * (s as f64 + 0.5) / N_TIMES_ATOM as f64).sin())
        .collect();
    let v_norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    for (s, &value) in v.iter().enumerate() {
        uv[[0, N_CHANNELS + s]] = value / v_norm;
    }

    let n_times_valid = n_times - N_TIMES_ATOM + 1;
    let mut z = Array3::zeros((1, n_trials, n_times_valid));
    for i in 0..n_trials {
        let mut t = rng.gen_range(0..10);
        while t < n_times_valid {
            z[[0, i, t]] = rng.gen_range(1.0..2.0);
            t += rng.gen_range(15..30);
        }
    }
    let mut x = construct_x_rank1(z.view(), uv.view(), N_CHANNELS);
    for value in x.iter_mut() {
        *value += 0.01 * rng.sample::<f64, _>(StandardNormal);
    }
    (x, uv)
}

fn options() -> LearnOptions {
    LearnOptions {
        reg: 0.1,
        n_iter: 30,
        random_state: Some(0),
        verbose: 0,
        ..LearnOptions::default()
    }
}

fn run(x: &Array3<f64>, n_atoms: usize, options: &LearnOptions) -> LearnResult {
    learn_d_z_multi(x.view(), n_atoms, N_TIMES_ATOM, options, None).unwrap()
}

fn assert_monotone(pobj: &[f64]) {
    for (step, pair) in pobj.windows(2).enumerate().skip(1) {
        assert!(
            pair[1] <= pair[0] + 1e-9 * pair[0].abs().max(1.0),
            "objective increased at step {step}: {} -> {}",
            pair[0],
            pair[1]
        );
    }
}

/// Delegates to the built-in update and counts the calls.
struct CountingUpdate<'a> {
    calls: &'a Cell<usize>,
}

impl DictionaryUpdate for CountingUpdate<'_> {
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
        self.calls.set(self.calls.get() + 1);
        RankOneUpdate.update(x, z, uv0, b_hat_0, solver, constraint, options)
    }
}

struct FailingUpdate;

impl DictionaryUpdate for FailingUpdate {
    fn update(
        &mut self,
        _x: ArrayView3<'_, f64>,
        _z: ArrayView3<'_, f64>,
        _uv0: ArrayView2<'_, f64>,
        _b_hat_0: &[f64],
        _solver: DSolver,
        _constraint: UvConstraint,
        _options: &DSolverOptions,
    ) -> Result<Array2<f64>, StageError> {
        Err("dictionary solver diverged".into())
    }
}

#[test]
fn trace_is_monotone_for_every_solver_pair() {
    let (x, _) = simulate(2, 96, 1);
    for solver_z in [ZSolver::Lbfgs, ZSolver::Ista, ZSolver::Fista] {
        for solver_d in [DSolver::Alternate, DSolver::Joint, DSolver::Lbfgs] {
            let result = run(
                &x,
                2,
                &LearnOptions {
                    n_iter: 8,
                    solver_z,
                    solver_d,
                    refine_support: false,
                    ..options()
                },
            );
            assert!(result.pobj.len() > 2, "{solver_z}/{solver_d}");
            assert_monotone(&result.pobj);
        }
    }
}

#[test]
fn trace_lengths_line_up() {
    let (x, _) = simulate(2, 96, 2);
    let result = run(&x, 2, &options());
    assert_eq!(result.pobj.len(), result.times.len());
    assert_eq!(result.pobj.len(), 1 + 2 * result.iterations);
    assert_eq!(result.times[0], 0.0);
    assert!(result.times.iter().all(|&t| t >= 0.0));
    assert_eq!(result.uv.dim(), (2, N_CHANNELS + N_TIMES_ATOM));
    assert_eq!(result.z.dim(), (2, 2, 96 - N_TIMES_ATOM + 1));
}

#[test]
fn atoms_stay_feasible_for_every_constraint() {
    let (x, _) = simulate(2, 80, 3);
    for uv_constraint in [UvConstraint::Joint, UvConstraint::Separate, UvConstraint::Box] {
        let result = run(
            &x,
            2,
            &LearnOptions {
                n_iter: 5,
                uv_constraint,
                ..options()
            },
        );
        for norm in constraint_norms(result.uv.view(), uv_constraint, N_CHANNELS) {
            assert!(norm <= 1.0 + 1e-9, "{uv_constraint}: {norm}");
        }
    }
}

#[test]
fn zero_iterations_return_initial_state() {
    let (x, _) = simulate(2, 64, 4);
    let result = run(&x, 3, &LearnOptions { n_iter: 0, ..options() });
    assert_eq!(result.pobj.len(), 1);
    assert_eq!(result.times, vec![0.0]);
    assert_eq!(result.iterations, 0);
    assert_eq!(result.status, LearnStatus::MaxIterations);
    assert!(result.z.iter().all(|&v| v == 0.0));
    let energy = 0.5 * x.iter().map(|v| v * v).sum::<f64>();
    assert!((result.pobj[0] - energy).abs() <= 1e-12 * energy);
    for norm in constraint_norms(result.uv.view(), UvConstraint::Separate, N_CHANNELS) {
        assert!(norm <= 1.0 + 1e-12);
    }
}

#[test]
fn huge_penalty_stops_before_dictionary_update() {
    let (x, _) = simulate(2, 64, 5);
    let calls = Cell::new(0);
    let mut func_d = CountingUpdate { calls: &calls };
    let result = learn_d_z_multi_with(
        x.view(),
        2,
        N_TIMES_ATOM,
        &mut func_d,
        &LearnOptions { reg: 1e6, ..options() },
        None,
    )
    .unwrap();
    assert_eq!(result.status, LearnStatus::AllActivationsZero);
    assert_eq!(result.pobj.len(), 1);
    assert_eq!(result.times.len(), 1);
    assert_eq!(result.iterations, 0);
    assert_eq!(calls.get(), 0);
    assert!(result.z.iter().all(|&v| v == 0.0));
}

#[test]
fn converges_before_iteration_budget() {
    let (x, uv_true) = simulate(3, 128, 6);
    let mut rng = StdRng::seed_from_u64(60);
    let uv_init = uv_true.mapv(|v| v + 0.2 * rng.sample::<f64, _>(StandardNormal));
    let result = run(
        &x,
        1,
        &LearnOptions {
            n_iter: 300,
            eps: 1e-4,
            uv_init: Some(uv_init),
            refine_support: false,
            ..options()
        },
    );
    assert_eq!(result.status, LearnStatus::Converged);
    assert!(result.iterations < 300);
    let last = *result.pobj.last().unwrap();
    assert!(last < 0.5 * result.pobj[0], "{last} vs {}", result.pobj[0]);
    assert_monotone(&result.pobj);
}

#[test]
fn warm_start_does_not_increase_objective() {
    let (x, _) = simulate(2, 96, 7);
    let prior = run(
        &x,
        2,
        &LearnOptions {
            n_iter: 5,
            refine_support: false,
            ..options()
        },
    );
    let prior_final = *prior.pobj.last().unwrap();

    let resumed = run(
        &x,
        2,
        &LearnOptions {
            n_iter: 1,
            uv_init: Some(prior.uv.clone()),
            z_init: Some(prior.z.clone()),
            refine_support: false,
            ..options()
        },
    );
    assert!((resumed.pobj[0] - prior_final).abs() <= 1e-9 * prior_final.abs().max(1.0));
    let resumed_final = *resumed.pobj.last().unwrap();
    assert!(resumed_final <= prior_final * (1.0 + 1e-9), "{resumed_final} > {prior_final}");
}

#[test]
fn resuming_from_refined_output_does_not_increase_objective() {
    let (x, _) = simulate(2, 96, 7);
    let prior = run(&x, 2, &LearnOptions { n_iter: 5, ..options() });

    let resumed = learn_d_z_multi(
        x.view(),
        2,
        N_TIMES_ATOM,
        &LearnOptions {
            n_iter: 1,
            uv_init: Some(prior.uv.clone()),
            z_init: Some(prior.z.clone()),
            ..options()
        },
        None,
    )
    .unwrap();

    // The refined activations are unsigned; the run starts from their positive part.
    let start = prior.z.mapv(|v| v.max(0.0));
    let expected = compute_objective(x.view(), start.view(), prior.uv.view(), 0.1, Evaluation::Raw);
    assert!((resumed.pobj[0] - expected).abs() <= 1e-9 * expected.abs().max(1.0));
    assert_eq!(resumed.pobj.len(), 3);
    for pair in resumed.pobj.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-9 * pair[0].abs().max(1.0), "{} -> {}", pair[0], pair[1]);
    }
}

#[test]
fn negative_initial_activations_start_at_zero() {
    let (x, _) = simulate(2, 64, 12);
    let n_times_valid = 64 - N_TIMES_ATOM + 1;
    let mut z_init = Array3::from_elem((1, 2, n_times_valid), -1.0);
    z_init[[0, 1, 5]] = 0.5;
    let result = run(
        &x,
        1,
        &LearnOptions {
            n_iter: 0,
            z_init: Some(z_init),
            refine_support: false,
            ..options()
        },
    );
    assert_eq!(result.status, LearnStatus::MaxIterations);
    assert!(result.z.iter().all(|&v| v >= 0.0));
    assert_eq!(result.z.iter().filter(|&&v| v > 0.0).count(), 1);
    let expected = compute_objective(x.view(), result.z.view(), result.uv.view(), 0.1, Evaluation::Raw);
    assert!((result.pobj[0] - expected).abs() <= 1e-12 * expected.max(1.0));
}

#[test]
fn target_objective_stops_after_first_iteration() {
    let (x, _) = simulate(2, 64, 8);
    let result = run(
        &x,
        2,
        &LearnOptions {
            stopping_pobj: Some(1e30),
            ..options()
        },
    );
    assert_eq!(result.status, LearnStatus::ReachedTarget);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.pobj.len(), 3);
}

#[test]
fn callback_runs_every_iteration_and_can_abort() {
    let (x, _) = simulate(2, 64, 9);
    let mut seen = Vec::new();
    let mut callback = |_x: ArrayView3<'_, f64>, uv: ArrayView2<'_, f64>, z: ArrayView3<'_, f64>, reg: f64| -> Result<(), StageError> {
        assert_eq!(reg, 0.1);
        seen.push((uv.dim(), z.dim()));
        if seen.len() == 2 {
            return Err("enough".into());
        }
        Ok(())
    };
    let err = learn_d_z_multi(
        x.view(),
        2,
        N_TIMES_ATOM,
        &options(),
        Some(&mut callback as &mut dyn Callback),
    )
    .unwrap_err();
    assert!(matches!(err, LearnError::Callback(ref inner) if inner.to_string() == "enough"));
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], ((2, N_CHANNELS + N_TIMES_ATOM), (2, 2, 64 - N_TIMES_ATOM + 1)));
}

#[test]
fn dictionary_errors_propagate() {
    let (x, _) = simulate(1, 64, 10);
    let err = learn_d_z_multi_with(x.view(), 1, N_TIMES_ATOM, &mut FailingUpdate, &options(), None).unwrap_err();
    assert!(matches!(err, LearnError::Dictionary(_)));
    assert!(err.to_string().contains("diverged"));
}

#[test]
fn configuration_errors_fail_before_any_work() {
    let (x, _) = simulate(2, 64, 11);
    let calls = Cell::new(0);
    let cases = [
        LearnOptions { reg: -1.0, ..options() },
        LearnOptions { eps: -1e-3, ..options() },
        LearnOptions {
            uv_init: Some(Array2::zeros((2, N_CHANNELS + N_TIMES_ATOM + 1))),
            ..options()
        },
        LearnOptions {
            z_init: Some(Array3::from_elem((2, 2, 64 - N_TIMES_ATOM + 1), f64::NAN)),
            ..options()
        },
    ];
    for case in &cases {
        let mut func_d = CountingUpdate { calls: &calls };
        assert!(learn_d_z_multi_with(x.view(), 2, N_TIMES_ATOM, &mut func_d, case, None).is_err());
    }
    let mut func_d = CountingUpdate { calls: &calls };
    assert!(matches!(
        learn_d_z_multi_with(x.view(), 0, N_TIMES_ATOM, &mut func_d, &options(), None),
        Err(LearnError::NoAtoms)
    ));
    assert!(matches!(
        learn_d_z_multi(x.view(), 1, 65, &options(), None),
        Err(LearnError::InvalidAtomLength { n_times_atom: 65, n_times: 64 })
    ));
    assert_eq!(calls.get(), 0);
}

#[test]
fn worker_count_does_not_change_result() {
    let (x, _) = simulate(4, 80, 12);
    let single = run(&x, 2, &LearnOptions { n_iter: 4, ..options() });
    let many = run(&x, 2, &LearnOptions { n_iter: 4, n_jobs: 3, ..options() });
    assert_eq!(single.pobj.len(), many.pobj.len());
    for (a, b) in single.pobj.iter().zip(many.pobj.iter()) {
        assert!((a - b).abs() <= 1e-12 * a.abs().max(1.0));
    }
}

#[test]
fn support_refinement_keeps_support_and_fit() {
    let (x, _) = simulate(2, 96, 13);
    let base = LearnOptions { n_iter: 6, ..options() };
    let raw = run(&x, 2, &LearnOptions { refine_support: false, ..base.clone() });
    let refined = run(&x, 2, &base);
    assert_eq!(raw.uv, refined.uv);
    for (r, z) in refined.z.iter().zip(raw.z.iter()) {
        if *z == 0.0 {
            assert_eq!(*r, 0.0);
        }
    }
    let fit_raw = compute_objective(x.view(), raw.z.view(), raw.uv.view(), 0.0, Evaluation::Raw);
    let fit_refined = compute_objective(x.view(), refined.z.view(), refined.uv.view(), 0.0, Evaluation::Raw);
    assert!(fit_refined <= fit_raw * (1.0 + 1e-9));
}

#[test]
fn seeded_runs_are_reproducible() {
    let (x, _) = simulate(2, 64, 14);
    let a = run(&x, 2, &LearnOptions { n_iter: 3, ..options() });
    let b = run(&x, 2, &LearnOptions { n_iter: 3, ..options() });
    assert_eq!(a.pobj, b.pobj);
    assert_eq!(a.uv, b.uv);
}
