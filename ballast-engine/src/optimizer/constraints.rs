//! Allocation bounds and the turnover filter.

#![allow(clippy::cast_precision_loss)]

/// Slack used when comparing weights against bounds.
pub const BOUND_TOLERANCE: f64 = 1e-12;

const MAX_PROJECTION_PASSES: usize = 50;

/// True when `n` weights in `[min, max]` can sum to `total`.
#[must_use]
pub fn bounds_feasible(n: usize, total: f64, min: f64, max: f64) -> bool {
    let n = n as f64;
    min <= max && n * min <= total + BOUND_TOLERANCE && n * max >= total - BOUND_TOLERANCE
}

/// Projects `weights` onto `{w : sum(w) = total, min <= w_i <= max}`.
///
/// Weights are first scaled to `total`, then assets outside the bounds are
/// pinned to the violated bound and the remainder is redistributed over the
/// free assets in proportion to their weight. Any residual left after the
/// passes is spread over the assets' slack, so the result holds both
/// constraints exactly. Returns `None` when the bounds are infeasible.
#[must_use]
pub fn project_to_bounds(weights: &[f64], total: f64, min: f64, max: f64) -> Option<Vec<f64>> {
    let n = weights.len();
    if n == 0 || !bounds_feasible(n, total, min, max) {
        return None;
    }

    let positive: f64 = weights.iter().map(|w| w.max(0.0)).sum();
    let mut w: Vec<f64> = if positive > 0.0 && positive.is_finite() {
        weights.iter().map(|v| v.max(0.0) * total / positive).collect()
    } else {
        vec![total / n as f64; n]
    };

    let mut pinned = vec![false; n];
    for _ in 0..MAX_PROJECTION_PASSES {
        let mut violated = false;
        for i in 0..n {
            if pinned[i] {
                continue;
            }
            if w[i] < min {
                w[i] = min;
                pinned[i] = true;
                violated = true;
            } else if w[i] > max {
                w[i] = max;
                pinned[i] = true;
                violated = true;
            }
        }
        if !violated {
            break;
        }

        let fixed: f64 = (0..n).filter(|i| pinned[*i]).map(|i| w[i]).sum();
        let free: Vec<usize> = (0..n).filter(|i| !pinned[*i]).collect();
        if free.is_empty() {
            break;
        }
        let remaining = total - fixed;
        let free_sum: f64 = free.iter().map(|i| w[*i]).sum();
        for i in &free {
            w[*i] = if free_sum > 0.0 {
                w[*i] * remaining / free_sum
            } else {
                remaining / free.len() as f64
            };
        }
    }

    for v in &mut w {
        *v = v.clamp(min, max);
    }
    spread_residual(&mut w, total, min, max);
    Some(w)
}

/// Moves `total - sum(w)` onto the assets in proportion to their slack
/// toward the bound in the needed direction.
fn spread_residual(w: &mut [f64], total: f64, min: f64, max: f64) {
    let residual = total - w.iter().sum::<f64>();
    if residual.abs() <= f64::EPSILON {
        return;
    }
    let slack: Vec<f64> = if residual > 0.0 {
        w.iter().map(|v| max - v).collect()
    } else {
        w.iter().map(|v| v - min).collect()
    };
    let total_slack: f64 = slack.iter().sum();
    if total_slack <= 0.0 {
        return;
    }
    for (v, s) in w.iter_mut().zip(&slack) {
        *v = (*v + residual * s / total_slack).clamp(min, max);
    }
}

/// Outcome of the turnover filter.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnoverResult {
    /// Filtered weights.
    pub weights: Vec<f64>,
    /// Assets held at their previous weight.
    pub frozen: usize,
    /// Every asset was frozen; `weights` is the previous vector.
    pub unchanged: bool,
    /// The moved assets could not absorb the residual within bounds.
    pub skipped: bool,
}

/// Holds assets whose proposed change is below `threshold` at their previous
/// weight and re-projects the remaining assets onto what is left.
#[must_use]
pub fn apply_turnover_filter(
    proposed: &[f64],
    previous: &[f64],
    threshold: f64,
    min: f64,
    max: f64,
) -> TurnoverResult {
    let frozen: Vec<bool> = proposed
        .iter()
        .zip(previous)
        .map(|(p, q)| (p - q).abs() < threshold)
        .collect();
    let frozen_count = frozen.iter().filter(|f| **f).count();

    if frozen_count == proposed.len() {
        return TurnoverResult {
            weights: previous.to_vec(),
            frozen: frozen_count,
            unchanged: true,
            skipped: false,
        };
    }
    if frozen_count == 0 {
        return TurnoverResult {
            weights: proposed.to_vec(),
            frozen: 0,
            unchanged: false,
            skipped: false,
        };
    }

    let held: f64 = previous
        .iter()
        .zip(&frozen)
        .filter(|(_, f)| **f)
        .map(|(q, _)| q)
        .sum();
    let moved: Vec<f64> = proposed
        .iter()
        .zip(&frozen)
        .filter(|(_, f)| !**f)
        .map(|(p, _)| *p)
        .collect();

    let Some(projected) = project_to_bounds(&moved, 1.0 - held, min, max) else {
        return TurnoverResult {
            weights: proposed.to_vec(),
            frozen: 0,
            unchanged: false,
            skipped: true,
        };
    };

    let mut moved_iter = projected.into_iter();
    let weights = frozen
        .iter()
        .zip(previous)
        .map(|(f, q)| if *f { Some(*q) } else { moved_iter.next() })
        .collect::<Option<Vec<f64>>>()
        .unwrap_or_else(|| proposed.to_vec());

    TurnoverResult {
        weights,
        frozen: frozen_count,
        unchanged: false,
        skipped: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn test_projection_caps_concentrated_weight() {
        let w = project_to_bounds(&[0.9, 0.05, 0.05], 1.0, 0.02, 0.40).unwrap();
        assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[0], 0.40, epsilon = 1e-12);
        assert_abs_diff_eq!(w[1], 0.30, epsilon = 1e-12);
        assert_abs_diff_eq!(w[2], 0.30, epsilon = 1e-12);
    }

    #[test]
    fn test_projection_lifts_floor() {
        let w = project_to_bounds(&[0.0, 0.3, 0.3, 0.4], 1.0, 0.02, 0.40).unwrap();
        assert_abs_diff_eq!(w[0], 0.02, epsilon = 1e-12);
        assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(w.iter().all(|v| *v <= 0.40 + 1e-12));
    }

    #[test]
    fn test_projection_infeasible() {
        assert!(project_to_bounds(&[0.5, 0.5], 1.0, 0.02, 0.40).is_none());
        assert!(!bounds_feasible(60, 1.0, 0.02, 0.40));
        assert!(bounds_feasible(3, 1.0, 0.02, 0.40));
    }

    #[test]
    fn test_projection_of_zero_vector_is_uniform() {
        let w = project_to_bounds(&[0.0, 0.0, 0.0, 0.0], 1.0, 0.02, 0.40).unwrap();
        for v in w {
            assert_abs_diff_eq!(v, 0.25, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_turnover_all_frozen_returns_previous() {
        let previous = [0.3, 0.3, 0.4];
        let result = apply_turnover_filter(&[0.302, 0.299, 0.399], &previous, 0.005, 0.02, 0.40);
        assert!(result.unchanged);
        assert_eq!(result.weights, previous.to_vec());
    }

    #[test]
    fn test_turnover_partial_freeze() {
        let previous = [0.30, 0.30, 0.40];
        let proposed = [0.302, 0.35, 0.348];
        let result = apply_turnover_filter(&proposed, &previous, 0.005, 0.02, 0.40);
        assert_eq!(result.frozen, 1);
        assert_eq!(result.weights[0], 0.30);
        assert_abs_diff_eq!(result.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.weights[1], 0.35 * 0.70 / 0.698, epsilon = 1e-12);
    }

    #[test]
    fn test_turnover_skipped_when_residual_does_not_fit() {
        let previous = [0.40, 0.40, 0.20];
        let proposed = [0.40, 0.30, 0.30];
        let result = apply_turnover_filter(&proposed, &previous, 0.005, 0.02, 0.40);
        assert!(!result.skipped);

        let result = apply_turnover_filter(&[0.1, 0.45, 0.45], &[0.1, 0.1, 0.1], 0.005, 0.02, 0.40);
        assert!(result.skipped);
        assert_eq!(result.weights, vec![0.1, 0.45, 0.45]);
    }

    proptest! {
        #[test]
        fn prop_projection_holds_bounds(
            raw in prop::collection::vec(0.0f64..1.0, 3..12),
        ) {
            let w = project_to_bounds(&raw, 1.0, 0.02, 0.40).unwrap();
            prop_assert!((w.iter().sum::<f64>() - 1.0).abs() <= 1e-9);
            for v in &w {
                prop_assert!(*v >= 0.02 - 1e-12 && *v <= 0.40 + 1e-12);
            }
        }
    }
}
