//! Per-cluster marginal likelihood by adaptive Gauss-Hermite quadrature.
//!
//! For one cluster and one parameter vector: find the conditional mode,
//! shift and scale the Gauss-Hermite grid by the mode and the Cholesky
//! factor of the inverse curvature, evaluate the marginal contribution
//! `log ∫ f(y|b) φ(b; 0, D) db` with a log-sum-exp reduction, and accumulate
//! gradient contributions for every parameter block as posterior-weighted
//! expectations of the complete-data score.

use nalgebra::{DMatrix, DVector};

use crate::data::{Cluster, ParameterVector};
use crate::error::{GlmmError, Result};
use crate::engine::mode::{find_mode, regularized_cholesky, ClusterModel, ModeControl, RandomEffectsMode};
use crate::engine::quadrature::{GaussHermite, MultiIndex};
use crate::family::FamilySpec;

/// One cluster's contribution to the marginal likelihood and its gradient.
#[derive(Debug, Clone)]
pub(crate) struct ClusterEval {
    pub loglik: f64,
    /// Gradient over the full packed parameter vector.
    pub grad: DVector<f64>,
    pub mode: RandomEffectsMode,
}

fn logsumexp(terms: &[f64]) -> f64 {
    let m = terms.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if m == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    m + terms.iter().map(|t| (t - m).exp()).sum::<f64>().ln()
}

/// Gradient of `log N(b; 0, L L^T)` with respect to the unconstrained
/// lower-Cholesky parameters (row-major lower triangle, log diagonal).
fn gaussian_theta_grad(l: &DMatrix<f64>, b: &DVector<f64>) -> Result<Vec<f64>> {
    let q = l.nrows();
    let v = l
        .solve_lower_triangular(b)
        .ok_or_else(|| GlmmError::Numerical("singular Cholesky factor".to_string()))?;
    let w = l
        .transpose()
        .solve_upper_triangular(&v)
        .ok_or_else(|| GlmmError::Numerical("singular Cholesky factor".to_string()))?;

    let mut grad = Vec::with_capacity(q * (q + 1) / 2);
    for i in 0..q {
        for j in 0..=i {
            if i == j {
                // Log-diagonal parameterization folds in the factor L_ii.
                grad.push(-1.0 + w[i] * v[i] * l[(i, i)]);
            } else {
                grad.push(w[i] * v[j]);
            }
        }
    }
    Ok(grad)
}

pub(crate) fn integrate_cluster(
    cluster: &Cluster,
    spec: &FamilySpec,
    params: &ParameterVector,
    rule: &GaussHermite,
    mode_control: &ModeControl,
    warm: Option<&DVector<f64>>,
) -> Result<ClusterEval> {
    let layout = params.layout();
    let model = ClusterModel::new(cluster, spec, params)?;
    let mode = find_mode(&model, mode_control, warm);

    let qt = model.re_dim();
    let order = rule.nodes.len();

    // Scale: B with B B^T = (neg Hessian)^{-1}, so B = Lm^{-T}.
    let (chol_m, _, _) = regularized_cholesky(&mode.neg_hessian);
    let lm = chol_m.l();
    let scale = lm
        .transpose()
        .solve_upper_triangular(&DMatrix::identity(qt, qt))
        .ok_or_else(|| GlmmError::Numerical("singular curvature factor".to_string()))?;
    let log_det_scale: f64 = -(0..qt).map(|i| lm[(i, i)].ln()).sum::<f64>();

    let sqrt2 = std::f64::consts::SQRT_2;
    let mut nodes: Vec<(DVector<f64>, f64)> = Vec::with_capacity(order.pow(qt as u32));
    let mut log_terms: Vec<f64> = Vec::with_capacity(order.pow(qt as u32));

    for idx in MultiIndex::new(order, qt) {
        let u = DVector::from_iterator(qt, idx.iter().map(|&k| rule.nodes[k]));
        let log_w: f64 = idx.iter().map(|&k| rule.weights[k].ln()).sum();
        let b = &mode.b + &scale * &u * sqrt2;
        let complete = model.penalized_loglik(&b);
        let term = log_w + u.norm_squared() + complete;
        log_terms.push(term);
        nodes.push((b, term));
    }

    let log_sum = logsumexp(&log_terms);
    let loglik = log_sum + 0.5 * qt as f64 * std::f64::consts::LN_2 + log_det_scale;

    // Gradient: posterior-weighted complete-data scores (envelope theorem —
    // the dependence of mode and scale on the parameters drops out).
    let mut grad = DVector::zeros(layout.total());
    let phis = &model.phis;
    let n = cluster.n_obs();

    for (b, term) in &nodes {
        let weight = (term - log_sum).exp();
        if weight == 0.0 {
            continue;
        }
        let (eta, eta_zi) = model.etas(b);

        for i in 0..n {
            let zi = eta_zi.as_ref().map(|v| v[i]);
            let s_eta = spec.score_eta(cluster.y[i], eta[i], phis, zi);
            for k in 0..layout.p {
                grad[k] += weight * s_eta * cluster.x[(i, k)];
            }
            if layout.n_phis > 0 {
                let s_phis = spec.score_phis(cluster.y[i], eta[i], phis, zi);
                for (k, s) in s_phis.iter().enumerate() {
                    // Chain rule onto the log scale.
                    grad[layout.offset_phis() + k] += weight * s * phis[k];
                }
            }
            if layout.p_zi > 0 {
                let s_zi = spec.score_eta_zi(cluster.y[i], eta[i], phis, zi);
                let x_zi = cluster.x_zi.as_ref().unwrap();
                for k in 0..layout.p_zi {
                    grad[layout.offset_gamma() + k] += weight * s_zi * x_zi[(i, k)];
                }
            }
        }

        let b_base = DVector::from_iterator(model.q, (0..model.q).map(|k| b[k]));
        let theta_grad = gaussian_theta_grad(&model.chol_l, &b_base)?;
        for (k, g) in theta_grad.iter().enumerate() {
            grad[layout.offset_theta() + k] += weight * g;
        }
        if model.q_zi > 0 {
            let b_zi = DVector::from_iterator(model.q_zi, (0..model.q_zi).map(|k| b[model.q + k]));
            let l_zi = model.chol_l_zi.as_ref().unwrap();
            let theta_zi_grad = gaussian_theta_grad(l_zi, &b_zi)?;
            for (k, g) in theta_zi_grad.iter().enumerate() {
                grad[layout.offset_theta_zi() + k] += weight * g;
            }
        }
    }

    Ok(ClusterEval {
        loglik,
        grad,
        mode,
    })
}
