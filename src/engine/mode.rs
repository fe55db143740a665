//! Per-cluster conditional-mode search.
//!
//! For a fixed parameter vector, each cluster's random-effects mode maximizes
//! the penalized log-likelihood `sum_i log_dens(y_i, eta_i(b)) +
//! log N(b; 0, D)` by damped Newton iteration. Non-convergence within the
//! iteration cap is non-fatal: the last iterate is returned with a status
//! flag and the fit records a warning.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::{Cluster, ParameterVector};
use crate::error::{GlmmError, Result};
use crate::family::FamilySpec;

/// Terminal state of one mode search. Both states are acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeStatus {
    Converged,
    MaxIterReached,
}

/// A cluster's conditional mode and the curvature at it. Ephemeral:
/// recomputed whenever the parameter vector changes, never cached across
/// parameter vectors.
#[derive(Debug, Clone)]
pub struct RandomEffectsMode {
    /// Mode of the (combined, when a zero part is present) random-effects
    /// vector.
    pub b: DVector<f64>,
    /// Negative Hessian of the penalized log-likelihood at the mode,
    /// regularized to positive-definite if necessary.
    pub neg_hessian: DMatrix<f64>,
    pub status: ModeStatus,
    /// Whether the curvature needed ridge regularization before its
    /// Cholesky factorization.
    pub regularized: bool,
}

/// Controls for the Newton iteration.
#[derive(Debug, Clone, Copy)]
pub struct ModeControl {
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for ModeControl {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-8,
        }
    }
}

/// Everything needed to evaluate one cluster's complete-data log-likelihood
/// as a function of its random-effects vector, for one parameter vector.
pub(crate) struct ClusterModel<'a> {
    pub cluster: &'a Cluster,
    pub spec: &'a FamilySpec,
    pub phis: Vec<f64>,
    /// Fixed-effects part of the linear predictor, per observation.
    pub eta_fixed: DVector<f64>,
    /// Fixed-effects part of the zero-part predictor, when present.
    pub eta_zi_fixed: Option<DVector<f64>>,
    /// Base random-effects dimension.
    pub q: usize,
    /// Zero-part random-effects dimension (0 when absent).
    pub q_zi: usize,
    /// Cholesky factor of the base covariance block.
    pub chol_l: DMatrix<f64>,
    /// Cholesky factor of the zero-part covariance block.
    pub chol_l_zi: Option<DMatrix<f64>>,
    /// Block-diagonal precision of the combined random-effects vector.
    pub precision: DMatrix<f64>,
    /// Normalizing constant of the combined Gaussian prior.
    pub log_norm_const: f64,
}

fn lower_inverse(l: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let q = l.nrows();
    l.solve_lower_triangular(&DMatrix::identity(q, q))
        .ok_or_else(|| GlmmError::Numerical("singular Cholesky factor".to_string()))
}

impl<'a> ClusterModel<'a> {
    pub fn new(cluster: &'a Cluster, spec: &'a FamilySpec, params: &ParameterVector) -> Result<Self> {
        let eta_fixed = &cluster.x * &params.beta;
        let eta_zi_fixed = match (&cluster.x_zi, &params.gamma) {
            (Some(x_zi), Some(gamma)) => Some(x_zi * gamma),
            _ => None,
        };

        let q = cluster.z.ncols();
        let q_zi = cluster.z_zi.as_ref().map_or(0, |m| m.ncols());
        let qt = q + q_zi;

        let chol_l = params.cholesky_factor();
        let chol_l_zi = (q_zi > 0)
            .then(|| params.cholesky_factor_zi())
            .flatten();

        let mut precision = DMatrix::zeros(qt, qt);
        let mut log_det = 0.0;
        {
            let l_inv = lower_inverse(&chol_l)?;
            let prec = l_inv.transpose() * &l_inv;
            precision.view_mut((0, 0), (q, q)).copy_from(&prec);
            log_det += 2.0 * (0..q).map(|i| chol_l[(i, i)].ln()).sum::<f64>();
        }
        if let Some(ref l_zi) = chol_l_zi {
            let l_inv = lower_inverse(l_zi)?;
            let prec = l_inv.transpose() * &l_inv;
            precision.view_mut((q, q), (q_zi, q_zi)).copy_from(&prec);
            log_det += 2.0 * (0..q_zi).map(|i| l_zi[(i, i)].ln()).sum::<f64>();
        }
        let log_norm_const =
            -0.5 * log_det - 0.5 * qt as f64 * (2.0 * std::f64::consts::PI).ln();

        Ok(Self {
            cluster,
            spec,
            phis: params.phis(),
            eta_fixed,
            eta_zi_fixed,
            q,
            q_zi,
            chol_l,
            chol_l_zi,
            precision,
            log_norm_const,
        })
    }

    pub fn re_dim(&self) -> usize {
        self.q + self.q_zi
    }

    /// Linear predictors at random-effects vector `b`.
    pub fn etas(&self, b: &DVector<f64>) -> (DVector<f64>, Option<DVector<f64>>) {
        let b_base = b.rows(0, self.q);
        let eta = &self.eta_fixed + &self.cluster.z * b_base;
        let eta_zi = self.eta_zi_fixed.as_ref().map(|fixed| {
            if self.q_zi > 0 {
                let b_zi = b.rows(self.q, self.q_zi);
                fixed + self.cluster.z_zi.as_ref().unwrap() * b_zi
            } else {
                fixed.clone()
            }
        });
        (eta, eta_zi)
    }

    /// Sum of per-observation log-densities at `b`.
    pub fn data_loglik(&self, b: &DVector<f64>) -> f64 {
        let (eta, eta_zi) = self.etas(b);
        (0..self.cluster.n_obs())
            .map(|i| {
                self.spec.log_dens(
                    self.cluster.y[i],
                    eta[i],
                    &self.phis,
                    eta_zi.as_ref().map(|v| v[i]),
                )
            })
            .sum()
    }

    /// Gaussian prior log-density of `b`.
    pub fn log_prior(&self, b: &DVector<f64>) -> f64 {
        self.log_norm_const - 0.5 * (b.transpose() * &self.precision * b)[(0, 0)]
    }

    /// Penalized (complete-data) log-likelihood.
    pub fn penalized_loglik(&self, b: &DVector<f64>) -> f64 {
        self.data_loglik(b) + self.log_prior(b)
    }

    /// Gradient of the penalized log-likelihood with respect to `b`.
    pub fn grad(&self, b: &DVector<f64>) -> DVector<f64> {
        let (eta, eta_zi) = self.etas(b);
        let n = self.cluster.n_obs();

        let mut g = DVector::zeros(self.re_dim());
        for i in 0..n {
            let zi = eta_zi.as_ref().map(|v| v[i]);
            let s_eta = self.spec.score_eta(self.cluster.y[i], eta[i], &self.phis, zi);
            for k in 0..self.q {
                g[k] += s_eta * self.cluster.z[(i, k)];
            }
            if self.q_zi > 0 {
                let s_zi = self.spec.score_eta_zi(self.cluster.y[i], eta[i], &self.phis, zi);
                let z_zi = self.cluster.z_zi.as_ref().unwrap();
                for k in 0..self.q_zi {
                    g[self.q + k] += s_zi * z_zi[(i, k)];
                }
            }
        }
        g - &self.precision * b
    }

    /// Curvature of the penalized log-likelihood by centered differences of
    /// the gradient.
    pub fn hessian(&self, b: &DVector<f64>) -> DMatrix<f64> {
        let qt = self.re_dim();
        let mut h = DMatrix::zeros(qt, qt);
        let mut probe = b.clone();
        for k in 0..qt {
            let step = 1e-5 * (1.0 + b[k].abs());
            probe[k] = b[k] + step;
            let up = self.grad(&probe);
            probe[k] = b[k] - step;
            let down = self.grad(&probe);
            probe[k] = b[k];
            let col = (up - down) / (2.0 * step);
            h.column_mut(k).copy_from(&col);
        }
        // Symmetrize: differencing noise breaks exact symmetry.
        let ht = h.transpose();
        (h + ht) * 0.5
    }
}

/// Cholesky-factor a matrix, ridge-regularizing the diagonal until it is
/// positive-definite. Returns the factorization and whether regularization
/// was needed.
pub(crate) fn regularized_cholesky(
    m: &DMatrix<f64>,
) -> (nalgebra::Cholesky<f64, nalgebra::Dyn>, DMatrix<f64>, bool) {
    if let Some(chol) = nalgebra::Cholesky::new(m.clone()) {
        return (chol, m.clone(), false);
    }
    let scale = 1.0 + (0..m.nrows()).map(|i| m[(i, i)].abs()).fold(0.0, f64::max);
    let mut ridge = 1e-8 * scale;
    loop {
        let mut reg = m.clone();
        for i in 0..m.nrows() {
            reg[(i, i)] += ridge;
        }
        if let Some(chol) = nalgebra::Cholesky::new(reg.clone()) {
            return (chol, reg, true);
        }
        ridge *= 10.0;
    }
}

/// Find the conditional mode for one cluster by damped Newton iteration.
pub(crate) fn find_mode(
    model: &ClusterModel<'_>,
    control: &ModeControl,
    warm: Option<&DVector<f64>>,
) -> RandomEffectsMode {
    let qt = model.re_dim();
    let mut b = warm.cloned().unwrap_or_else(|| DVector::zeros(qt));
    let mut status = ModeStatus::MaxIterReached;
    let mut regularized = false;

    let mut current = model.penalized_loglik(&b);
    for _ in 0..control.max_iter {
        let g = model.grad(&b);
        if g.amax() < control.tol {
            status = ModeStatus::Converged;
            break;
        }

        let h = model.hessian(&b);
        let (chol, _, reg) = regularized_cholesky(&(-h));
        regularized |= reg;
        let direction = chol.solve(&g);

        // Step-halving keeps the iteration ascending.
        let mut step = 1.0;
        let mut accepted = false;
        for _ in 0..10 {
            let candidate = &b + &direction * step;
            let value = model.penalized_loglik(&candidate);
            if value > current {
                b = candidate;
                current = value;
                accepted = true;
                break;
            }
            step *= 0.5;
        }
        if !accepted {
            // No ascent direction left; settle for the current iterate.
            if g.amax() < control.tol.max(1e-4) {
                status = ModeStatus::Converged;
            }
            break;
        }
    }

    let h = model.hessian(&b);
    let (_, neg_hessian, reg) = regularized_cholesky(&(-h));
    regularized |= reg;

    RandomEffectsMode {
        b,
        neg_hessian,
        status,
        regularized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MixedModelData, ParamLayout};
    use crate::family::{FamilySpec, Poisson};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn poisson_cluster() -> (MixedModelData, FamilySpec, ParameterVector) {
        let y = DVector::from_vec(vec![2.0, 4.0, 1.0, 3.0, 5.0]);
        let x = DMatrix::from_element(5, 1, 1.0);
        let z = DMatrix::from_element(5, 1, 1.0);
        let group = vec!["g".to_string(); 5];
        let data = MixedModelData::new(y, x, group, z).unwrap();
        let spec = FamilySpec::new(Arc::new(Poisson)).unwrap();
        let layout = ParamLayout {
            p: 1,
            q: 1,
            n_phis: 0,
            p_zi: 0,
            q_zi: 0,
        };
        let mut params = ParameterVector::init(layout);
        params.beta[0] = 1.0;
        params.theta = vec![0.7f64.ln()];
        (data, spec, params)
    }

    #[test]
    fn test_mode_zeroes_gradient() {
        let (data, spec, params) = poisson_cluster();
        let clusters = data.clusters();
        let model = ClusterModel::new(&clusters[0], &spec, &params).unwrap();
        let mode = find_mode(&model, &ModeControl::default(), None);
        assert_eq!(mode.status, ModeStatus::Converged);
        assert!(model.grad(&mode.b).amax() < 1e-6);
    }

    #[test]
    fn test_mode_is_a_maximum() {
        let (data, spec, params) = poisson_cluster();
        let clusters = data.clusters();
        let model = ClusterModel::new(&clusters[0], &spec, &params).unwrap();
        let mode = find_mode(&model, &ModeControl::default(), None);
        let at_mode = model.penalized_loglik(&mode.b);
        for delta in [-0.1, 0.1] {
            let mut b = mode.b.clone();
            b[0] += delta;
            assert!(model.penalized_loglik(&b) < at_mode);
        }
        // Curvature positive (negative Hessian of a maximum).
        assert!(mode.neg_hessian[(0, 0)] > 0.0);
    }

    #[test]
    fn test_iteration_cap_is_nonfatal() {
        let (data, spec, params) = poisson_cluster();
        let clusters = data.clusters();
        let model = ClusterModel::new(&clusters[0], &spec, &params).unwrap();
        let mode = find_mode(
            &model,
            &ModeControl {
                max_iter: 1,
                tol: 1e-14,
            },
            None,
        );
        // One Newton step is not enough at this tolerance, but we still get
        // a usable iterate and curvature.
        assert!(mode.b[0].is_finite());
        assert!(mode.neg_hessian[(0, 0)] > 0.0);
    }

    #[test]
    fn test_tiny_prior_variance_pins_mode_near_zero() {
        let (data, spec, mut params) = poisson_cluster();
        params.theta = vec![1e-4f64.ln()];
        let clusters = data.clusters();
        let model = ClusterModel::new(&clusters[0], &spec, &params).unwrap();
        let mode = find_mode(&model, &ModeControl::default(), None);
        assert_relative_eq!(mode.b[0], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_regularized_cholesky_recovers() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -0.5]);
        let (_, reg, flagged) = regularized_cholesky(&m);
        assert!(flagged);
        assert!(nalgebra::Cholesky::new(reg).is_some());
    }
}
