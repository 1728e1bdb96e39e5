//! Small special-function helpers shared by the state and the learner.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// The digamma function ψ(x) for positive `x`.
///
/// Uses the standard recurrence to push the argument above 6 and then the
/// asymptotic expansion. Accurate to well below the 1e-3 convergence
/// tolerance the variational updates run with.
pub fn digamma(x: f64) -> f64 {
    debug_assert!(x > 0.0);
    let mut result = 0.0;
    let mut x = x;
    while x < 6.0 {
        result -= 1.0 / x;
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    result + x.ln() - 0.5 * inv
        - inv2 * (1.0 / 12.0 - inv2 * (1.0 / 120.0 - inv2 / 252.0))
}

/// `ψ(x_i) - ψ(Σx)` for a Dirichlet parameter vector.
pub fn dirichlet_expectation(x: ArrayView1<f64>) -> Array1<f64> {
    let psi_total = digamma(x.sum());
    x.mapv(|v| digamma(v) - psi_total)
}

/// Row-wise [`dirichlet_expectation`].
pub fn dirichlet_expectation_2d(x: ArrayView2<f64>) -> Array2<f64> {
    let mut out = x.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let psi_total = digamma(row.sum());
        row.mapv_inplace(|v| digamma(v) - psi_total);
    }
    out
}
