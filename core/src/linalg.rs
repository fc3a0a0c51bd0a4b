//! Linear algebra helpers for covariance handling.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn chol_solve_spd(s, b, opt) -> Option<DMatrix<f64>>
//!     pub fn condition_number(m: &DMatrix<f64>) -> f64
//!     pub fn is_positive_semidefinite(m: &DMatrix<f64>, tolerance: f64) -> bool
//!     pub fn saturate(m: &DMatrix<f64>, ceiling: f64) -> DMatrix<f64>
//!
//! Strategy for solving against an innovation covariance S:
//! 1) Symmetrize S ← 0.5 (S + Sᵀ)
//! 2) Reject it if the symmetric eigenvalue condition number is above the ceiling
//! 3) Cholesky
//! 4) Jittered Cholesky (geometric ramp)

use nalgebra::DMatrix;
use nalgebra::linalg::{Cholesky, SymmetricEigen};

/// Average a covariance with its transpose so round-off never leaves it asymmetric.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Diagonal loading applied when a plain Cholesky factorization of an innovation covariance
/// fails. The jitter starts at `initial_jitter` and grows tenfold per attempt.
#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub initial_jitter: f64,
    pub max_jitter: f64,
    pub max_tries: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 6,
        }
    }
}

/// Solve `S X = B` for a symmetric positive definite `S`.
///
/// Used for the Kalman gain, where `S` is the innovation covariance and `B` is `H P`. The input is
/// symmetrized first; if the factorization still fails, the diagonal is loaded with the jitter
/// ramp of [SolveOptions]. `None` means `S` is not positive definite even with the largest jitter.
pub fn chol_solve_spd(
    s: &DMatrix<f64>,
    b: &DMatrix<f64>,
    opt: SolveOptions,
) -> Option<DMatrix<f64>> {
    assert!(s.is_square(), "chol_solve_spd: S must be square");
    assert_eq!(s.nrows(), b.nrows(), "chol_solve_spd: S and B incompatible");

    let s_sym = symmetrize(s);
    let n = s_sym.nrows();
    let loads = std::iter::once(0.0).chain(
        std::iter::successors(Some(opt.initial_jitter), |j| Some(j * 10.0))
            .take(opt.max_tries)
            .take_while(|j| *j <= opt.max_jitter),
    );
    for load in loads {
        let loaded = &s_sym + DMatrix::<f64>::identity(n, n) * load;
        // a zero pivot factors without error but solves to inf/NaN
        if let Some(x) = Cholesky::new(loaded).map(|f| f.solve(b)) {
            if is_finite(&x) {
                return Some(x);
            }
        }
    }
    None
}

/// 2-norm condition number of a symmetric matrix, `|λ|max / |λ|min`.
///
/// Returns `f64::INFINITY` when the matrix is not finite, has a non-positive
/// eigenvalue, or is empty. The caller is expected to pass a symmetrized matrix;
/// only the lower triangle is read by the eigen decomposition.
pub fn condition_number(m: &DMatrix<f64>) -> f64 {
    assert!(m.is_square(), "condition_number: matrix must be square");
    if m.nrows() == 0 || !is_finite(m) {
        return f64::INFINITY;
    }
    let eigenvalues = SymmetricEigen::new(m.clone()).eigenvalues;
    let min = eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = eigenvalues.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(min > 0.0) {
        return f64::INFINITY;
    }
    max / min
}

/// True when every entry of the matrix is finite.
#[inline]
pub fn is_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}

/// True when the symmetric part of `m` has no eigenvalue below `-tolerance · max|λ|`.
///
/// Non-finite matrices are never positive semidefinite. The zero matrix is.
pub fn is_positive_semidefinite(m: &DMatrix<f64>, tolerance: f64) -> bool {
    assert!(m.is_square(), "is_positive_semidefinite: matrix must be square");
    if !is_finite(m) {
        return false;
    }
    if m.nrows() == 0 {
        return true;
    }
    let eigenvalues = SymmetricEigen::new(symmetrize(m)).eigenvalues;
    let largest = eigenvalues.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    eigenvalues.iter().all(|v| *v >= -tolerance * largest)
}

/// Largest relative asymmetry `|a_ij - a_ji| / max(1, |a_ij|, |a_ji|)` of a square matrix.
pub fn max_asymmetry(m: &DMatrix<f64>) -> f64 {
    assert!(m.is_square(), "max_asymmetry: matrix must be square");
    let mut worst = 0.0f64;
    for i in 0..m.nrows() {
        for j in (i + 1)..m.ncols() {
            let (a, b) = (m[(i, j)], m[(j, i)]);
            let scale = 1.0f64.max(a.abs()).max(b.abs());
            worst = worst.max((a - b).abs() / scale);
        }
    }
    worst
}

/// Clamp a covariance to the numerical saturation ceiling.
///
/// Diagonal entries are limited to `[0, ceiling]` and off-diagonal entries to
/// `[-ceiling, ceiling]`; NaN entries become the ceiling on the diagonal and zero
/// elsewhere. The result is symmetric.
pub fn saturate(m: &DMatrix<f64>, ceiling: f64) -> DMatrix<f64> {
    let mut out = symmetrize(m);
    for i in 0..out.nrows() {
        for j in 0..out.ncols() {
            let v = out[(i, j)];
            out[(i, j)] = if i == j {
                if v.is_nan() { ceiling } else { v.clamp(0.0, ceiling) }
            } else if v.is_nan() {
                0.0
            } else {
                v.clamp(-ceiling, ceiling)
            };
        }
    }
    out
}
