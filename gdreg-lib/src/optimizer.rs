// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Nonlinear scalar minimizers driving the affine solver.
//!
//! The contract is minimal: a cost consumes a point and yields a value plus,
//! when asked, the gradient at that point. Two drivers are provided, a
//! quasi-Newton L-BFGS with backtracking line search (default) and a
//! Powell-style derivative-free cyclic line minimizer; both respect a
//! maximum function-evaluation budget.

use nalgebra::DVector;

/// Scalar cost function over a parameter vector.
pub trait ScalarCost {
    fn dim(&self) -> usize;
    /// Value at `x`; fills `grad` when provided.
    fn evaluate(&mut self, x: &DVector<f64>, grad: Option<&mut DVector<f64>>) -> f64;
}

/// Outcome of a minimization run.
#[derive(Debug, Clone, Copy)]
pub struct MinimizeReport {
    pub value: f64,
    pub evaluations: usize,
    pub converged: bool,
}

/// L-BFGS history length.
const MEMORY: usize = 6;
const ARMIJO_C1: f64 = 1e-4;
const BACKTRACK: f64 = 0.5;
const MAX_BACKTRACKS: usize = 20;

/// Quasi-Newton minimization; stops on the gradient-norm tolerance or when
/// the evaluation budget runs out.
pub fn lbfgs(
    cost: &mut dyn ScalarCost,
    x: &mut DVector<f64>,
    max_evaluations: usize,
    tolerance: f64,
) -> MinimizeReport {
    let n = cost.dim();
    let mut evaluations = 0usize;
    let mut grad = DVector::zeros(n);
    let mut value = cost.evaluate(x, Some(&mut grad));
    evaluations += 1;

    let mut s_hist: Vec<DVector<f64>> = Vec::new();
    let mut y_hist: Vec<DVector<f64>> = Vec::new();
    let mut rho_hist: Vec<f64> = Vec::new();

    while evaluations < max_evaluations {
        let grad_norm = grad.norm();
        if grad_norm < tolerance {
            return MinimizeReport {
                value,
                evaluations,
                converged: true,
            };
        }

        // Two-loop recursion for the search direction.
        let mut q = grad.clone();
        let mut alphas = vec![0.0f64; s_hist.len()];
        for i in (0..s_hist.len()).rev() {
            let alpha = rho_hist[i] * s_hist[i].dot(&q);
            q -= &y_hist[i] * alpha;
            alphas[i] = alpha;
        }
        if let (Some(s), Some(y)) = (s_hist.last(), y_hist.last()) {
            let scale = s.dot(y) / y.dot(y);
            q *= scale;
        }
        for i in 0..s_hist.len() {
            let beta = rho_hist[i] * y_hist[i].dot(&q);
            q += &s_hist[i] * (alphas[i] - beta);
        }
        let mut direction = -q;
        let mut descent = direction.dot(&grad);
        if descent >= 0.0 {
            // History produced an ascent direction; fall back to steepest
            // descent and drop the history.
            direction = -grad.clone();
            descent = direction.dot(&grad);
            s_hist.clear();
            y_hist.clear();
            rho_hist.clear();
        }

        // Backtracking Armijo line search.
        let mut step = if s_hist.is_empty() {
            1.0 / grad_norm.max(1.0)
        } else {
            1.0
        };
        let mut accepted = false;
        let mut new_x = x.clone();
        for _ in 0..MAX_BACKTRACKS {
            if evaluations >= max_evaluations {
                break;
            }
            new_x = &*x + &direction * step;
            let trial = cost.evaluate(&new_x, None);
            evaluations += 1;
            if trial <= value + ARMIJO_C1 * step * descent {
                accepted = true;
                break;
            }
            step *= BACKTRACK;
        }
        if !accepted {
            return MinimizeReport {
                value,
                evaluations,
                converged: false,
            };
        }

        let mut new_grad = DVector::zeros(n);
        let new_value = cost.evaluate(&new_x, Some(&mut new_grad));
        evaluations += 1;

        let s = &new_x - &*x;
        let y = &new_grad - &grad;
        let sy = s.dot(&y);
        if sy > 1e-12 {
            if s_hist.len() == MEMORY {
                s_hist.remove(0);
                y_hist.remove(0);
                rho_hist.remove(0);
            }
            rho_hist.push(1.0 / sy);
            s_hist.push(s);
            y_hist.push(y);
        }
        *x = new_x;
        value = new_value;
        grad = new_grad;
    }
    MinimizeReport {
        value,
        evaluations,
        converged: false,
    }
}

/// Golden-section line minimization of `f` on an expanding bracket around 0.
fn line_minimize<F: FnMut(f64) -> Option<f64>>(
    mut f: F,
    initial_step: f64,
    iterations: usize,
) -> Option<(f64, f64)> {
    // Bracket the minimum by stepping out in both directions.
    let f0 = f(0.0)?;
    let mut a = -initial_step;
    let mut b = initial_step;
    let mut fa = f(a)?;
    let mut fb = f(b)?;
    for _ in 0..10 {
        if fa < f0 && fa <= fb {
            a *= 2.0;
            fa = f(a)?;
        } else if fb < f0 && fb < fa {
            b *= 2.0;
            fb = f(b)?;
        } else {
            break;
        }
    }

    // Golden-section shrink on [a, b].
    let phi = 0.618_033_988_749_895_f64;
    let mut x1 = b - phi * (b - a);
    let mut x2 = a + phi * (b - a);
    let mut f1 = f(x1)?;
    let mut f2 = f(x2)?;
    for _ in 0..iterations {
        if f1 < f2 {
            b = x2;
            x2 = x1;
            f2 = f1;
            x1 = b - phi * (b - a);
            f1 = f(x1)?;
        } else {
            a = x1;
            x1 = x2;
            f1 = f2;
            x2 = a + phi * (b - a);
            f2 = f(x2)?;
        }
    }
    let (t, ft) = if f1 < f2 { (x1, f1) } else { (x2, f2) };
    if ft < f0 {
        Some((t, ft))
    } else {
        Some((0.0, f0))
    }
}

/// Powell-style derivative-free minimization: cyclic line minimizations
/// along a direction set, replacing the direction of largest decrease with
/// the overall displacement after each cycle.
pub fn powell(
    cost: &mut dyn ScalarCost,
    x: &mut DVector<f64>,
    max_evaluations: usize,
    tolerance: f64,
) -> MinimizeReport {
    let n = cost.dim();
    let mut evaluations = 0usize;
    let mut value = cost.evaluate(x, None);
    evaluations += 1;

    let mut directions: Vec<DVector<f64>> = (0..n)
        .map(|i| {
            let mut e = DVector::zeros(n);
            e[i] = 1.0;
            e
        })
        .collect();

    loop {
        let cycle_start_value = value;
        let cycle_start_x = x.clone();
        let mut best_decrease = 0.0f64;
        let mut best_direction = 0usize;

        for (di, dir) in directions.iter().enumerate() {
            if evaluations >= max_evaluations {
                break;
            }
            let budget_left = max_evaluations - evaluations;
            let mut used = 0usize;
            let result = line_minimize(
                |t| {
                    if used >= budget_left {
                        return None;
                    }
                    used += 1;
                    Some(cost.evaluate(&(&*x + dir * t), None))
                },
                0.5,
                24,
            );
            evaluations += used;
            if let Some((t, ft)) = result {
                if ft < value {
                    let decrease = value - ft;
                    if decrease > best_decrease {
                        best_decrease = decrease;
                        best_direction = di;
                    }
                    *x += dir * t;
                    value = ft;
                }
            }
        }

        let total_decrease = cycle_start_value - value;
        if total_decrease < tolerance {
            return MinimizeReport {
                value,
                evaluations,
                converged: true,
            };
        }
        if evaluations >= max_evaluations {
            return MinimizeReport {
                value,
                evaluations,
                converged: false,
            };
        }
        // Replace the most productive direction with the cycle displacement.
        let displacement = &*x - &cycle_start_x;
        if displacement.norm() > 1e-12 {
            directions[best_direction] = displacement;
        }
    }
}
