use core::fmt;
use core::str::FromStr;

use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut1, s};

/// A solver, constraint, or mode name that is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseNameError {
    pub kind: &'static str,
    pub name: String,
    pub expected: &'static [&'static str],
}

impl fmt::Display for ParseNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown {} '{}' (expected one of {})",
            self.kind,
            self.name,
            self.expected.join(", ")
        )
    }
}

impl std::error::Error for ParseNameError {}

/// Norm constraint defining the feasible set of atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UvConstraint {
    /// `||[u, v]||_2 <= 1`.
    Joint,
    /// `||u||_2 <= 1` and `||v||_2 <= 1`.
    #[default]
    Separate,
    /// `||[u, v]||_inf <= 1`.
    Box,
}

impl UvConstraint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Joint => "joint",
            Self::Separate => "separate",
            Self::Box => "box",
        }
    }
}

impl fmt::Display for UvConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UvConstraint {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "joint" => Ok(Self::Joint),
            "separate" => Ok(Self::Separate),
            "box" => Ok(Self::Box),
            _ => Err(ParseNameError {
                kind: "uv constraint",
                name: s.to_owned(),
                expected: &["joint", "separate", "box"],
            }),
        }
    }
}

/// Atoms projected onto the feasible set.
#[derive(Debug, Clone)]
pub struct Projection {
    pub uv: Array2<f64>,
    /// Per-atom factor by which `u_k v_k^T` shrank. Multiplying the
    /// activations of atom `k` by `norms[k]` leaves the reconstruction unchanged.
    pub norms: Array1<f64>,
}

/// Project every atom of `uv` onto the feasible set of `constraint`.
///
/// Atoms that already satisfy the constraint are left untouched and get a
/// factor of exactly 1.
pub fn prox_uv(uv: ArrayView2<'_, f64>, constraint: UvConstraint, n_channels: usize) -> Projection {
    let mut projected = uv.to_owned();
    let mut norms = Array1::ones(uv.nrows());
    for (k, mut atom) in projected.rows_mut().into_iter().enumerate() {
        norms[k] = match constraint {
            UvConstraint::Joint => {
                let norm = shrink_to_ball(atom.view_mut(), 1.0);
                norm * norm
            }
            UvConstraint::Separate => {
                let (u, v) = atom.multi_slice_mut((s![..n_channels], s![n_channels..]));
                shrink_to_ball(u, 1.0) * shrink_to_ball(v, 1.0)
            }
            UvConstraint::Box => {
                let norm = atom.fold(0.0_f64, |acc, &x| acc.max(x.abs())).max(1.0);
                atom.mapv_inplace(|x| x / norm);
                norm * norm
            }
        };
    }
    Projection {
        uv: projected,
        norms,
    }
}

/// Scale `part` onto the L2 ball of `radius` if it lies outside.
///
/// Returns the divisor applied, 1 when `part` was left untouched.
pub(crate) fn shrink_to_ball(mut part: ArrayViewMut1<'_, f64>, radius: f64) -> f64 {
    let norm = part.dot(&part).sqrt();
    if norm <= radius {
        return 1.0;
    }
    if radius <= 0.0 {
        part.fill(0.0);
        return f64::INFINITY;
    }
    let divisor = norm / radius;
    part.mapv_inplace(|x| x / divisor);
    divisor
}

/// Largest constraint norm of each atom (≤ 1 for every feasible atom).
pub fn constraint_norms(uv: ArrayView2<'_, f64>, constraint: UvConstraint, n_channels: usize) -> Array1<f64> {
    uv.rows()
        .into_iter()
        .map(|atom| match constraint {
            UvConstraint::Joint => atom.dot(&atom).sqrt(),
            UvConstraint::Separate => {
                let u = atom.slice(s![..n_channels]);
                let v = atom.slice(s![n_channels..]);
                u.dot(&u).sqrt().max(v.dot(&v).sqrt())
            }
            UvConstraint::Box => atom.fold(0.0_f64, |acc, &x| acc.max(x.abs())),
        })
        .collect()
}
