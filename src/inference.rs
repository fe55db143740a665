//! Inference on a completed fit: observed-information covariance and
//! likelihood-ratio tests.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::engine::mode::regularized_cholesky;
use crate::error::{GlmmError, Result};
use crate::fit::MixedModelFit;

/// Numerical Hessian of the negative log-likelihood by centered differences
/// of its gradient, then the covariance of the estimates as its inverse.
/// Returns the covariance and whether the Hessian needed regularization.
pub(crate) fn observed_information_vcov<F>(
    grad_fn: &mut F,
    x: &DVector<f64>,
) -> Result<(DMatrix<f64>, bool)>
where
    F: FnMut(&DVector<f64>) -> Result<DVector<f64>>,
{
    let n = x.len();
    let mut hessian = DMatrix::zeros(n, n);
    let mut probe = x.clone();
    for k in 0..n {
        let step = 1e-5 * (1.0 + x[k].abs());
        probe[k] = x[k] + step;
        let up = grad_fn(&probe)?;
        probe[k] = x[k] - step;
        let down = grad_fn(&probe)?;
        probe[k] = x[k];
        let col = (up - down) / (2.0 * step);
        hessian.column_mut(k).copy_from(&col);
    }
    // Symmetrize: differencing noise breaks exact symmetry.
    let ht = hessian.transpose();
    let hessian = (hessian + ht) * 0.5;

    if let Some(chol) = nalgebra::Cholesky::new(hessian.clone()) {
        return Ok((chol.inverse(), false));
    }
    let (chol, _, _) = regularized_cholesky(&hessian);
    Ok((chol.inverse(), true))
}

/// Result of a likelihood-ratio test between two nested fits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrtResult {
    /// Test statistic `2 (ll_full - ll_reduced)`, clamped at zero.
    pub statistic: f64,
    /// Degrees of freedom: the difference in free parameter counts.
    pub df: usize,
    pub p_value: f64,
    pub ll_full: f64,
    pub ll_reduced: f64,
}

/// Likelihood-ratio test of a reduced model against a full model.
///
/// Both fits must be on the same data; the reduced model must have strictly
/// fewer free parameters (a model compared against itself is the one
/// zero-degrees-of-freedom case allowed, and yields statistic 0, p-value 1).
pub fn lrt(full: &MixedModelFit, reduced: &MixedModelFit) -> Result<LrtResult> {
    if full.n_obs != reduced.n_obs || full.response() != reduced.response() {
        return Err(GlmmError::NotNested(
            "models were fitted to different data".to_string(),
        ));
    }
    let (k_full, k_reduced) = (full.n_params(), reduced.n_params());
    if k_reduced > k_full {
        return Err(GlmmError::NotNested(format!(
            "reduced model has more parameters ({}) than the full model ({})",
            k_reduced, k_full
        )));
    }

    let ll_full = full.log_likelihood;
    let ll_reduced = reduced.log_likelihood;
    let df = k_full - k_reduced;

    if df == 0 {
        // Same parameter count is only nested when it is the same model.
        if (ll_full - ll_reduced).abs() > 1e-8 {
            return Err(GlmmError::NotNested(
                "models have equal parameter counts but different likelihoods".to_string(),
            ));
        }
        return Ok(LrtResult {
            statistic: 0.0,
            df: 0,
            p_value: 1.0,
            ll_full,
            ll_reduced,
        });
    }

    let statistic = (2.0 * (ll_full - ll_reduced)).max(0.0);
    let chi = ChiSquared::new(df as f64)
        .map_err(|e| GlmmError::Numerical(format!("chi-squared distribution: {}", e)))?;
    let p_value = 1.0 - chi.cdf(statistic);

    Ok(LrtResult {
        statistic,
        df,
        p_value,
        ll_full,
        ll_reduced,
    })
}
