//! Quasi-Newton outer optimizer.
//!
//! A dense BFGS minimizer over the unconstrained parameter vector. The
//! inverse-Hessian approximation starts at the identity, updates are skipped
//! when the curvature condition fails, and a backtracking Armijo line search
//! guards each step. Hitting the iteration cap is reported, not fatal; the
//! best iterate seen is always returned.

use nalgebra::{DMatrix, DVector};

use crate::error::Result;

#[derive(Debug, Clone)]
pub(crate) struct BfgsControl {
    pub max_iter: usize,
    /// Convergence threshold on the gradient infinity norm.
    pub grad_tol: f64,
    /// Convergence threshold on the relative objective decrease.
    pub obj_tol: f64,
}

impl Default for BfgsControl {
    fn default() -> Self {
        Self {
            max_iter: 200,
            grad_tol: 1e-5,
            obj_tol: 1e-9,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BfgsOutcome {
    pub x: DVector<f64>,
    pub value: f64,
    pub grad: DVector<f64>,
    pub iterations: usize,
    pub converged: bool,
}

const ARMIJO_C1: f64 = 1e-4;
const MAX_HALVINGS: usize = 40;

/// Minimize `f`, which returns the objective value and gradient together.
pub(crate) fn minimize<F>(f: &mut F, x0: DVector<f64>, control: &BfgsControl) -> Result<BfgsOutcome>
where
    F: FnMut(&DVector<f64>) -> Result<(f64, DVector<f64>)>,
{
    let n = x0.len();
    let (mut value, mut grad) = f(&x0)?;
    let mut x = x0;
    let mut h_inv: DMatrix<f64> = DMatrix::identity(n, n);

    let mut best_x = x.clone();
    let mut best_value = value;
    let mut best_grad = grad.clone();

    if grad.amax() < control.grad_tol {
        return Ok(BfgsOutcome {
            x,
            value,
            grad,
            iterations: 0,
            converged: true,
        });
    }

    let mut converged = false;
    let mut iterations = 0;
    for iter in 1..=control.max_iter {
        iterations = iter;

        let mut direction = -(&h_inv * &grad);
        let mut slope = direction.dot(&grad);
        if !slope.is_finite() || slope >= 0.0 {
            // The approximation has gone bad; restart from steepest descent.
            h_inv = DMatrix::identity(n, n);
            direction = -grad.clone();
            slope = direction.dot(&grad);
        }

        // Backtracking line search with the Armijo sufficient-decrease rule.
        let mut step = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_HALVINGS {
            let candidate = &x + &direction * step;
            let (cand_value, cand_grad) = f(&candidate)?;
            if cand_value.is_finite() && cand_value <= value + ARMIJO_C1 * step * slope {
                accepted = Some((candidate, cand_value, cand_grad));
                break;
            }
            step *= 0.5;
        }
        let Some((new_x, new_value, new_grad)) = accepted else {
            // No descent achievable along this direction.
            break;
        };

        let s = &new_x - &x;
        let yv = &new_grad - &grad;
        let sy = s.dot(&yv);
        if sy > 1e-10 * s.norm() * yv.norm() {
            let rho = 1.0 / sy;
            let identity = DMatrix::identity(n, n);
            let left = &identity - &s * yv.transpose() * rho;
            let right = &identity - &yv * s.transpose() * rho;
            h_inv = &left * &h_inv * &right + &s * s.transpose() * rho;
        }

        let obj_change = (value - new_value).abs();
        x = new_x;
        value = new_value;
        grad = new_grad;

        if value < best_value {
            best_x = x.clone();
            best_value = value;
            best_grad = grad.clone();
        }

        if grad.amax() < control.grad_tol {
            converged = true;
            break;
        }
        if obj_change <= control.obj_tol * (1.0 + value.abs()) {
            converged = true;
            break;
        }
    }

    // Return the best iterate even when the loop ended early or at the cap.
    if best_value < value {
        x = best_x;
        value = best_value;
        grad = best_grad;
    }

    Ok(BfgsOutcome {
        x,
        value,
        grad,
        iterations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_quadratic_bowl_exact_minimum() {
        // f(x) = 0.5 (x - c)' A (x - c) with diagonal A.
        let c = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let a = [2.0, 5.0, 0.7];
        let mut f = |x: &DVector<f64>| -> Result<(f64, DVector<f64>)> {
            let d = x - &c;
            let value = 0.5 * d.iter().zip(&a).map(|(di, ai)| ai * di * di).sum::<f64>();
            let grad = DVector::from_iterator(3, d.iter().zip(&a).map(|(di, ai)| ai * di));
            Ok((value, grad))
        };
        let out = minimize(&mut f, DVector::zeros(3), &BfgsControl::default()).unwrap();
        assert!(out.converged);
        for i in 0..3 {
            assert_relative_eq!(out.x[i], c[i], epsilon = 1e-4);
        }
        assert!(out.value < 1e-8);
    }

    #[test]
    fn test_rosenbrock_converges() {
        let mut f = |x: &DVector<f64>| -> Result<(f64, DVector<f64>)> {
            let (a, b) = (x[0], x[1]);
            let value = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
            let grad = DVector::from_vec(vec![
                -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
                200.0 * (b - a * a),
            ]);
            Ok((value, grad))
        };
        let control = BfgsControl {
            max_iter: 500,
            ..BfgsControl::default()
        };
        let out = minimize(&mut f, DVector::from_vec(vec![-1.2, 1.0]), &control).unwrap();
        assert!(out.value < 1e-8);
        assert_relative_eq!(out.x[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(out.x[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_iteration_cap_returns_best_iterate() {
        let mut f = |x: &DVector<f64>| -> Result<(f64, DVector<f64>)> {
            let value = x[0].powi(4) + x[1].powi(4);
            let grad = DVector::from_vec(vec![4.0 * x[0].powi(3), 4.0 * x[1].powi(3)]);
            Ok((value, grad))
        };
        let control = BfgsControl {
            max_iter: 2,
            ..BfgsControl::default()
        };
        let start = DVector::from_vec(vec![3.0, -3.0]);
        let start_value = 2.0 * 81.0;
        let out = minimize(&mut f, start, &control).unwrap();
        assert!(!out.converged);
        assert_eq!(out.iterations, 2);
        assert!(out.value < start_value);
    }

    #[test]
    fn test_already_converged_start() {
        let mut f = |x: &DVector<f64>| -> Result<(f64, DVector<f64>)> {
            Ok((x.norm_squared(), 2.0 * x))
        };
        let out = minimize(&mut f, DVector::zeros(2), &BfgsControl::default()).unwrap();
        assert!(out.converged);
        assert_eq!(out.iterations, 0);
    }
}
