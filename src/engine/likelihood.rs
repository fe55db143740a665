//! The marginal likelihood objective: aggregation over clusters.
//!
//! Cluster contributions are independent and evaluated in parallel, then
//! reduced in cluster-index order so repeated runs are bit-reproducible.
//! A one-slot cache keyed on the exact parameter vector lets the paired
//! objective and gradient calls of the outer optimizer share a single
//! evaluation; any other parameter vector is recomputed from scratch.

use std::sync::Mutex;

use nalgebra::DVector;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{Cluster, ParamLayout, ParameterVector};
use crate::engine::integrator::{integrate_cluster, ClusterEval};
use crate::engine::mode::{ModeControl, ModeStatus, RandomEffectsMode};
use crate::engine::quadrature::GaussHermite;
use crate::error::Result;
use crate::family::FamilySpec;

/// Recoverable numerical events observed during a fit. These are surfaced as
/// flags on the result; they never abort the fit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitWarnings {
    /// Clusters whose mode search hit its iteration cap.
    pub mode_nonconvergence: usize,
    /// Clusters whose curvature needed ridge regularization.
    pub curvature_regularized: usize,
    /// The outer optimizer stopped at its iteration cap.
    pub optimizer_max_iter: bool,
    /// The numerical Hessian needed regularization before inversion.
    pub vcov_regularized: bool,
}

impl FitWarnings {
    pub fn is_clean(&self) -> bool {
        *self == FitWarnings::default()
    }
}

/// One evaluation of the objective at a fixed parameter vector.
#[derive(Debug, Clone)]
pub(crate) struct Evaluation {
    pub neg_loglik: f64,
    pub neg_grad: DVector<f64>,
    pub modes: Vec<RandomEffectsMode>,
    pub mode_nonconvergence: usize,
    pub curvature_regularized: usize,
}

/// The negative marginal log-likelihood over all clusters.
pub(crate) struct MarginalLikelihood<'a> {
    clusters: &'a [Cluster],
    spec: &'a FamilySpec,
    layout: ParamLayout,
    rule: GaussHermite,
    mode_control: ModeControl,
    cache: Mutex<Option<(DVector<f64>, Evaluation)>>,
}

impl<'a> MarginalLikelihood<'a> {
    pub fn new(
        clusters: &'a [Cluster],
        spec: &'a FamilySpec,
        layout: ParamLayout,
        rule: GaussHermite,
        mode_control: ModeControl,
    ) -> Self {
        Self {
            clusters,
            spec,
            layout,
            rule,
            mode_control,
            cache: Mutex::new(None),
        }
    }

    /// Evaluate objective and gradient at a packed parameter vector.
    pub fn evaluate(&self, flat: &DVector<f64>) -> Result<Evaluation> {
        if let Ok(guard) = self.cache.lock() {
            if let Some((cached_x, cached)) = guard.as_ref() {
                if cached_x == flat {
                    return Ok(cached.clone());
                }
            }
        }

        let params = ParameterVector::unpack(self.layout, flat)?;
        let evals: Vec<ClusterEval> = self
            .clusters
            .par_iter()
            .map(|cluster| {
                integrate_cluster(cluster, self.spec, &params, &self.rule, &self.mode_control, None)
            })
            .collect::<Result<Vec<_>>>()?;

        // Deterministic reduction in cluster-index order.
        let mut loglik = 0.0;
        let mut grad = DVector::zeros(self.layout.total());
        let mut modes = Vec::with_capacity(evals.len());
        let mut mode_nonconvergence = 0;
        let mut curvature_regularized = 0;
        for eval in evals {
            loglik += eval.loglik;
            grad += &eval.grad;
            if eval.mode.status == ModeStatus::MaxIterReached {
                mode_nonconvergence += 1;
            }
            if eval.mode.regularized {
                curvature_regularized += 1;
            }
            modes.push(eval.mode);
        }

        let evaluation = Evaluation {
            neg_loglik: -loglik,
            neg_grad: -grad,
            modes,
            mode_nonconvergence,
            curvature_regularized,
        };

        if let Ok(mut guard) = self.cache.lock() {
            *guard = Some((flat.clone(), evaluation.clone()));
        }
        Ok(evaluation)
    }
}
