//! The end-to-end maximum-likelihood fit.
//!
//! [`fit_glmm`] ties the pieces together: validate the family against the
//! data, pick a quadrature rule within the node budget, warm-start the
//! parameters, run the quasi-Newton outer loop on the marginal likelihood,
//! and finish with a numerical-Hessian covariance of the estimates.

use nalgebra::{DMatrix, DVector};

use crate::data::{Cluster, MixedModelData, ParamLayout, ParameterVector};
use crate::engine::likelihood::{FitWarnings, MarginalLikelihood};
use crate::engine::mode::ModeControl;
use crate::engine::optimizer::{minimize, BfgsControl};
use crate::engine::quadrature::{effective_order, gauss_hermite};
use crate::engine::RandomEffectsMode;
use crate::error::{GlmmError, Result};
use crate::family::FamilySpec;
use crate::inference;

/// Tuning knobs for one fit. The defaults are deliberately conservative;
/// most callers only ever touch `quad_order`.
#[derive(Debug, Clone)]
pub struct GlmmControl {
    /// Requested per-dimension Gauss-Hermite order.
    pub quad_order: usize,
    /// Cap on the tensor-product node count; the per-dimension order is
    /// reduced automatically when `quad_order^q` exceeds it.
    pub node_budget: usize,
    /// Iteration cap for each cluster's conditional-mode search.
    pub mode_max_iter: usize,
    /// Gradient tolerance for the mode search.
    pub mode_tol: f64,
    /// Iteration cap for the outer optimizer.
    pub max_iter: usize,
    /// Outer convergence threshold on the gradient infinity norm.
    pub grad_tol: f64,
    /// Outer convergence threshold on the relative objective decrease.
    pub obj_tol: f64,
    /// Whether to moment-match intercepts before optimizing.
    pub warm_start: bool,
    /// Explicit starting values; overrides the warm start when set.
    pub initial: Option<ParameterVector>,
}

impl Default for GlmmControl {
    fn default() -> Self {
        Self {
            quad_order: 11,
            node_budget: 1000,
            mode_max_iter: 100,
            mode_tol: 1e-8,
            max_iter: 200,
            grad_tol: 1e-5,
            obj_tol: 1e-9,
            warm_start: true,
            initial: None,
        }
    }
}

/// Which linear predictor the fitted values condition on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FittedKind {
    /// Random effects set to zero (population-typical predictions).
    Population,
    /// Random effects at each cluster's conditional mode.
    Conditional,
}

/// A completed maximum-likelihood fit.
#[derive(Debug, Clone)]
pub struct MixedModelFit {
    /// Estimates in structured form.
    pub params: ParameterVector,
    /// Maximized marginal log-likelihood.
    pub log_likelihood: f64,
    /// Gradient of the marginal log-likelihood at the estimates.
    pub gradient: DVector<f64>,
    /// Covariance of the unconstrained parameter estimates (inverse observed
    /// information).
    pub vcov: DMatrix<f64>,
    /// Conditional modes at the estimates, in cluster order.
    pub modes: Vec<RandomEffectsMode>,
    /// Whether the outer optimizer met its convergence criteria.
    pub converged: bool,
    /// Outer iterations used.
    pub iterations: usize,
    /// Recoverable numerical events observed along the way.
    pub warnings: FitWarnings,
    pub n_obs: usize,
    pub n_clusters: usize,
    spec: FamilySpec,
    clusters: Vec<Cluster>,
    response: DVector<f64>,
}

impl MixedModelFit {
    pub fn family(&self) -> &FamilySpec {
        &self.spec
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn response(&self) -> &DVector<f64> {
        &self.response
    }

    /// Number of free parameters, for likelihood-ratio comparisons.
    pub fn n_params(&self) -> usize {
        self.params.layout().total()
    }

    /// Standard errors of the unconstrained parameters. Entries whose
    /// variance came out non-positive are NaN.
    pub fn std_errors(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.vcov.nrows(),
            (0..self.vcov.nrows()).map(|i| {
                let v = self.vcov[(i, i)];
                if v > 0.0 {
                    v.sqrt()
                } else {
                    f64::NAN
                }
            }),
        )
    }

    /// Fitted conditional means, one per observation in the original row
    /// order.
    pub fn fitted(&self, kind: FittedKind) -> DVector<f64> {
        let phis = self.params.phis();
        let mut out = DVector::zeros(self.n_obs);
        for (cluster, mode) in self.clusters.iter().zip(&self.modes) {
            let q = cluster.z.ncols();
            let q_zi = cluster.z_zi.as_ref().map_or(0, |m| m.ncols());
            let b = match kind {
                FittedKind::Population => DVector::zeros(q + q_zi),
                FittedKind::Conditional => mode.b.clone(),
            };
            let eta = &cluster.x * &self.params.beta + &cluster.z * b.rows(0, q);
            let eta_zi = match (&cluster.x_zi, &self.params.gamma) {
                (Some(x_zi), Some(gamma)) => {
                    let mut e = x_zi * gamma;
                    if q_zi > 0 {
                        e += cluster.z_zi.as_ref().unwrap() * b.rows(q, q_zi);
                    }
                    Some(e)
                }
                _ => None,
            };
            for (row, &i) in cluster.indices.iter().enumerate() {
                out[i] =
                    self.spec
                        .conditional_mean(eta[row], &phis, eta_zi.as_ref().map(|e| e[row]));
            }
        }
        out
    }
}

fn check_family_data(data: &MixedModelData, spec: &FamilySpec) -> Result<()> {
    if spec.has_zero_part() && !data.has_zero_part() {
        return Err(GlmmError::InvalidParameter(format!(
            "family '{}' needs a zero-part design but the data carries none",
            spec.name()
        )));
    }
    if !spec.has_zero_part() && data.has_zero_part() {
        return Err(GlmmError::InvalidParameter(format!(
            "data carries a zero-part design but family '{}' has no zero part",
            spec.name()
        )));
    }
    Ok(())
}

/// Moment-match the intercepts so the optimizer starts near plausible means.
/// Only constant columns are touched; anything else stays at zero.
fn warm_start(params: &mut ParameterVector, data: &MixedModelData, spec: &FamilySpec) {
    let y = data.response();
    let n = y.len() as f64;
    let mean = y.iter().sum::<f64>() / n;

    let find_constant_column = |m: &DMatrix<f64>| -> Option<usize> {
        (0..m.ncols()).find(|&c| (0..m.nrows()).all(|r| (m[(r, c)] - 1.0).abs() < 1e-12))
    };

    let target = match spec.link() {
        crate::family::Link::Log => mean.max(1e-3).ln(),
        crate::family::Link::Logit => {
            let p = mean.clamp(1e-3, 1.0 - 1e-3);
            (p / (1.0 - p)).ln()
        }
        crate::family::Link::Identity => mean,
    };
    if let Some(c) = find_constant_column(data.fixed_design()) {
        params.beta[c] = target;
    }

    if let (Some(x_zi), Some(gamma)) = (data.zero_fixed_design(), params.gamma.as_mut()) {
        let zero_prop = y.iter().filter(|v| **v == 0.0).count() as f64 / n;
        let p = zero_prop.clamp(1e-2, 1.0 - 1e-2);
        if let Some(c) = find_constant_column(x_zi) {
            gamma[c] = (p / (1.0 - p)).ln();
        }
    }
}

/// Fit a GLMM by adaptive Gauss-Hermite maximum likelihood.
pub fn fit_glmm(
    data: &MixedModelData,
    spec: &FamilySpec,
    control: &GlmmControl,
) -> Result<MixedModelFit> {
    check_family_data(data, spec)?;

    let layout = ParamLayout {
        p: data.n_fixed(),
        q: data.n_random(),
        n_phis: spec.n_dispersion(),
        p_zi: data.n_zi_fixed(),
        q_zi: data.n_zi_random(),
    };

    let clusters = data.clusters();
    let qt = layout.q + layout.q_zi;
    let order = effective_order(control.quad_order, qt, control.node_budget);
    let rule = gauss_hermite(order);
    let mode_control = ModeControl {
        max_iter: control.mode_max_iter,
        tol: control.mode_tol,
    };

    let mut start = match control.initial {
        Some(ref init) => {
            if init.layout() != layout {
                return Err(GlmmError::InvalidParameter(
                    "initial parameter layout does not match the model".to_string(),
                ));
            }
            init.clone()
        }
        None => ParameterVector::init(layout),
    };
    if control.initial.is_none() && control.warm_start {
        warm_start(&mut start, data, spec);
    }

    let objective = MarginalLikelihood::new(&clusters, spec, layout, rule, mode_control);
    let mut eval_fn = |x: &DVector<f64>| -> Result<(f64, DVector<f64>)> {
        let e = objective.evaluate(x)?;
        Ok((e.neg_loglik, e.neg_grad))
    };

    let bfgs = BfgsControl {
        max_iter: control.max_iter,
        grad_tol: control.grad_tol,
        obj_tol: control.obj_tol,
    };
    let outcome = minimize(&mut eval_fn, start.pack(), &bfgs)?;

    // Cache hit: the optimizer already evaluated its final iterate.
    let final_eval = objective.evaluate(&outcome.x)?;

    let mut warnings = FitWarnings {
        mode_nonconvergence: final_eval.mode_nonconvergence,
        curvature_regularized: final_eval.curvature_regularized,
        optimizer_max_iter: !outcome.converged,
        vcov_regularized: false,
    };

    let mut grad_fn = |x: &DVector<f64>| -> Result<DVector<f64>> {
        Ok(objective.evaluate(x)?.neg_grad)
    };
    let (vcov, vcov_regularized) = inference::observed_information_vcov(&mut grad_fn, &outcome.x)?;
    warnings.vcov_regularized = vcov_regularized;

    Ok(MixedModelFit {
        params: ParameterVector::unpack(layout, &outcome.x)?,
        log_likelihood: -outcome.value,
        gradient: -final_eval.neg_grad,
        vcov,
        modes: final_eval.modes,
        converged: outcome.converged,
        iterations: outcome.iterations,
        warnings,
        n_obs: data.n_obs(),
        n_clusters: clusters.len(),
        spec: spec.clone(),
        clusters,
        response: data.response().clone(),
    })
}
