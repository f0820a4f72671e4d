//! Raw weighting schemes. Every function returns long-only unit-sum weights.

#![allow(clippy::cast_precision_loss)]

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use tracing::debug;

const SINGULAR_EPS: f64 = 1e-12;

/// Uniform weights.
#[must_use]
pub fn equal_weight(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    vec![1.0 / n as f64; n]
}

/// Positive part of `inv(cov) * excess`, normalized.
///
/// Solved by Cholesky when `cov` is positive definite, otherwise through the
/// pseudo-inverse. Falls back to equal weights when no asset has a positive
/// weight.
#[must_use]
pub fn max_sharpe(cov: &DMatrix<f64>, excess: &DVector<f64>) -> Vec<f64> {
    let n = excess.len();
    let direction = match cov.clone().cholesky() {
        Some(chol) => Some(chol.solve(excess)),
        None => cov
            .clone()
            .pseudo_inverse(SINGULAR_EPS)
            .ok()
            .map(|pinv| pinv * excess),
    };

    let Some(direction) = direction else {
        debug!("covariance could not be inverted, using equal weights");
        return equal_weight(n);
    };
    let positive: Vec<f64> = direction.iter().map(|v| v.max(0.0)).collect();
    let total: f64 = positive.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        debug!("no asset with positive excess return, using equal weights");
        return equal_weight(n);
    }
    positive.into_iter().map(|v| v / total).collect()
}

/// Equilibrium returns `delta * S * w` implied by holding `prior`.
#[must_use]
pub fn implied_returns(cov: &DMatrix<f64>, prior: &DVector<f64>, risk_aversion: f64) -> DVector<f64> {
    cov * prior * risk_aversion
}

/// Black-Litterman posterior with one absolute view per asset.
///
/// View uncertainty is `Omega = diag(tau * S)`, so with `P = I` the posterior
/// is `pi + tau S (tau S + Omega)^-1 (views - pi)`. Returns `None` when the
/// system cannot be solved.
#[must_use]
pub fn black_litterman_posterior(
    cov: &DMatrix<f64>,
    pi: &DVector<f64>,
    views: &DVector<f64>,
    tau: f64,
) -> Option<DVector<f64>> {
    let tau_cov = cov * tau;
    let omega = DMatrix::from_diagonal(&tau_cov.diagonal());
    let gap = views - pi;
    let system = &tau_cov + omega;
    let adjustment = match system.clone().cholesky() {
        Some(chol) => chol.solve(&gap),
        None => system.pseudo_inverse(SINGULAR_EPS).ok()? * gap,
    };
    Some(pi + tau_cov * adjustment)
}

/// Tangency weights on the Black-Litterman posterior.
///
/// The equilibrium comes from equal prior weights; the estimated returns are
/// the views.
#[must_use]
pub fn black_litterman(
    cov: &DMatrix<f64>,
    views: &DVector<f64>,
    risk_aversion: f64,
    tau: f64,
) -> Vec<f64> {
    let n = views.len();
    let prior = DVector::from_vec(equal_weight(n));
    let pi = implied_returns(cov, &prior, risk_aversion);
    match black_litterman_posterior(cov, &pi, views, tau) {
        Some(posterior) => max_sharpe(cov, &posterior),
        None => {
            debug!("posterior could not be solved, using equal weights");
            equal_weight(n)
        }
    }
}

/// Min-max weights against a worst case around the estimates.
///
/// The covariance is inflated to `(1 + covariance_margin) S` and each
/// expected return is cut by `return_margin` times its worst-case volatility
/// before the [`max_sharpe`] solve.
#[must_use]
pub fn robust_min_max(
    cov: &DMatrix<f64>,
    expected: &DVector<f64>,
    covariance_margin: f64,
    return_margin: f64,
) -> Vec<f64> {
    let worst_cov = cov * (1.0 + covariance_margin);
    let worst_returns = DVector::from_iterator(
        expected.len(),
        expected
            .iter()
            .zip(worst_cov.diagonal().iter())
            .map(|(mu, var)| mu - return_margin * var.max(0.0).sqrt()),
    );
    max_sharpe(&worst_cov, &worst_returns)
}

/// Equal risk contributions by cyclical coordinate descent.
///
/// Each pass solves `x_i * (S x)_i = b_i` for asset `i` with the others held
/// fixed. Returns the weights and whether the largest update of the last pass
/// fell below `tolerance`.
#[must_use]
pub fn risk_parity(cov: &DMatrix<f64>, tolerance: f64, max_iterations: usize) -> (Vec<f64>, bool) {
    let n = cov.nrows();
    if n == 0 {
        return (Vec::new(), true);
    }
    if (0..n).any(|i| cov[(i, i)] <= SINGULAR_EPS) {
        return (equal_weight(n), true);
    }

    let budget = 1.0 / n as f64;
    let mut x: Vec<f64> = (0..n).map(|i| 1.0 / cov[(i, i)].sqrt()).collect();
    let mut converged = false;
    for _ in 0..max_iterations {
        let mut largest = 0.0_f64;
        for i in 0..n {
            let sii = cov[(i, i)];
            let c: f64 = (0..n).filter(|j| *j != i).map(|j| cov[(i, j)] * x[j]).sum();
            let updated = (-c + (c * c + 4.0 * sii * budget).sqrt()) / (2.0 * sii);
            largest = largest.max((updated - x[i]).abs() / updated.abs().max(1.0));
            x[i] = updated;
        }
        if largest < tolerance {
            converged = true;
            break;
        }
    }

    let total: f64 = x.iter().sum();
    if !total.is_finite() || total <= 0.0 || x.iter().any(|v| *v < 0.0) {
        return (equal_weight(n), false);
    }
    (x.into_iter().map(|v| v / total).collect(), converged)
}

/// Long-only minimum variance by projected gradient descent on the simplex.
#[must_use]
pub fn min_variance(cov: &DMatrix<f64>, tolerance: f64, max_iterations: usize) -> (Vec<f64>, bool) {
    let n = cov.nrows();
    if n == 0 {
        return (Vec::new(), true);
    }
    let lambda_max = SymmetricEigen::new(cov.clone()).eigenvalues.max();
    if !lambda_max.is_finite() || lambda_max <= SINGULAR_EPS {
        return (equal_weight(n), true);
    }

    let step = 1.0 / (2.0 * lambda_max);
    let mut w = DVector::from_element(n, 1.0 / n as f64);
    for _ in 0..max_iterations {
        let gradient = cov * &w * 2.0;
        let next = project_to_simplex(&(&w - gradient * step));
        let change = (&next - &w).amax();
        w = next;
        if change < tolerance {
            return (w.iter().copied().collect(), true);
        }
    }
    (w.iter().copied().collect(), false)
}

/// Euclidean projection onto `{w >= 0, sum(w) = 1}` (Duchi et al., 2008).
fn project_to_simplex(v: &DVector<f64>) -> DVector<f64> {
    let mut sorted: Vec<f64> = v.iter().copied().collect();
    sorted.sort_by(|a, b| b.total_cmp(a));

    let mut cumulative = 0.0;
    let mut theta = 0.0;
    for (j, u) in sorted.iter().enumerate() {
        cumulative += u;
        let candidate = (cumulative - 1.0) / (j + 1) as f64;
        if u - candidate > 0.0 {
            theta = candidate;
        }
    }
    v.map(|x| (x - theta).max(0.0))
}
