//! End-to-end tests: data generation, fitting, inference, and simulation
//! through the public API only.

use adaptive_glmm::prelude::*;
use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

/// Poisson random-intercept data: `y ~ Poisson(exp(beta' x + b))`,
/// `b ~ N(0, sd^2)` per cluster.
fn generate_poisson(
    n_clusters: usize,
    obs_per_cluster: usize,
    beta: &[f64],
    sd: f64,
    seed: u64,
) -> MixedModelData {
    let mut rng = Rng::new(seed);
    let n = n_clusters * obs_per_cluster;
    let p = beta.len();

    let mut y = Vec::with_capacity(n);
    let mut x = DMatrix::zeros(n, p);
    let mut group = Vec::with_capacity(n);

    let mut row = 0;
    for c in 0..n_clusters {
        let b = rng.next_normal(0.0, sd);
        for j in 0..obs_per_cluster {
            x[(row, 0)] = 1.0;
            if p > 1 {
                // Within-cluster covariate, balanced across levels.
                x[(row, 1)] = (j % 2) as f64;
            }
            let eta: f64 = (0..p).map(|k| beta[k] * x[(row, k)]).sum::<f64>() + b;
            y.push(rng.next_poisson(eta.exp()) as f64);
            group.push(format!("c{}", c));
            row += 1;
        }
    }

    let z = DMatrix::from_element(n, 1, 1.0);
    MixedModelData::new(DVector::from_vec(y), x, group, z).unwrap()
}

fn gaussian_family() -> CustomFamily {
    // Identity link, one dispersion (the residual variance). No analytic
    // scores, so the engine runs on centered differences throughout.
    CustomFamilyBuilder::new("gaussian", Link::Identity)
        .n_dispersion(1)
        .log_dens(|y, eta, phis, _zi| {
            let phi = phis[0];
            -0.5 * (2.0 * std::f64::consts::PI * phi).ln() - (y - eta).powi(2) / (2.0 * phi)
        })
        .build()
        .unwrap()
}

#[test]
fn test_poisson_random_intercept_recovery() {
    let data = generate_poisson(80, 8, &[1.0], 0.5, 42);
    let family = FamilySpec::new(Arc::new(Poisson)).unwrap();
    let fit = fit_glmm(&data, &family, &GlmmControl::default()).unwrap();

    assert!(fit.converged);
    assert_eq!(fit.n_clusters, 80);
    assert_eq!(fit.n_obs, 640);
    assert!((fit.params.beta[0] - 1.0).abs() < 0.25);

    let tau = fit.params.covariance()[(0, 0)].sqrt();
    assert!(tau > 0.25 && tau < 0.85, "tau = {}", tau);

    // Gradient near zero at the maximum.
    assert!(fit.gradient.amax() < 1e-3);

    // Standard errors are finite and positive for every parameter.
    let se = fit.std_errors();
    assert!(se.iter().all(|s| s.is_finite() && *s > 0.0));
}

#[test]
fn test_fitted_conditional_tracks_data_better_than_population() {
    let data = generate_poisson(40, 10, &[1.0], 0.7, 7);
    let family = FamilySpec::new(Arc::new(Poisson)).unwrap();
    let fit = fit_glmm(&data, &family, &GlmmControl::default()).unwrap();

    let y = fit.response();
    let mse = |fitted: &DVector<f64>| {
        fitted
            .iter()
            .zip(y.iter())
            .map(|(f, yi)| (f - yi).powi(2))
            .sum::<f64>()
    };
    let population = fit.fitted(FittedKind::Population);
    let conditional = fit.fitted(FittedKind::Conditional);
    assert_eq!(population.len(), fit.n_obs);
    assert!(mse(&conditional) < mse(&population));

    // Population predictions ignore cluster identity, so they are constant
    // within a design cell; here the design is intercept-only.
    for v in population.iter() {
        assert_relative_eq!(*v, population[0], epsilon = 1e-12);
    }
}

#[test]
fn test_gaussian_marginal_likelihood_matches_closed_form() {
    // Gaussian random-intercept data, evaluated at fixed parameters: the
    // adaptive rule integrates a Gaussian integrand exactly, so the marginal
    // log-likelihood must match the closed-form multivariate normal.
    let mut rng = Rng::new(11);
    let (n_clusters, m) = (12, 5);
    let (beta0, tau, phi): (f64, f64, f64) = (0.3, 0.6, 0.8);

    let n = n_clusters * m;
    let mut y = Vec::with_capacity(n);
    let mut group = Vec::with_capacity(n);
    for c in 0..n_clusters {
        let b = rng.next_normal(0.0, tau);
        for _ in 0..m {
            y.push(beta0 + b + rng.next_normal(0.0, phi.sqrt()));
            group.push(format!("c{}", c));
        }
    }
    let y = DVector::from_vec(y);
    let x = DMatrix::from_element(n, 1, 1.0);
    let z = DMatrix::from_element(n, 1, 1.0);
    let data = MixedModelData::new(y.clone(), x, group, z).unwrap();

    let family = FamilySpec::new(Arc::new(gaussian_family())).unwrap();
    let layout = ParamLayout {
        p: 1,
        q: 1,
        n_phis: 1,
        p_zi: 0,
        q_zi: 0,
    };
    let mut params = ParameterVector::init(layout);
    params.beta[0] = beta0;
    params.theta = vec![tau.ln()];
    params.log_phis = vec![phi.ln()];

    // Zero outer iterations: evaluate the likelihood at the given point.
    let control = GlmmControl {
        max_iter: 0,
        warm_start: false,
        initial: Some(params),
        ..GlmmControl::default()
    };
    let fit = fit_glmm(&data, &family, &control).unwrap();

    // Closed form per cluster: y_c ~ N(beta0 1, phi I + tau^2 J).
    let tau2 = tau * tau;
    let mut expected = 0.0;
    for c in 0..n_clusters {
        let rows: Vec<usize> = (c * m..(c + 1) * m).collect();
        let r: Vec<f64> = rows.iter().map(|&i| y[i] - beta0).collect();
        let sum_r: f64 = r.iter().sum();
        let rr: f64 = r.iter().map(|v| v * v).sum();
        let denom = phi + m as f64 * tau2;
        let log_det = (m as f64 - 1.0) * phi.ln() + denom.ln();
        let quad = (rr - tau2 * sum_r * sum_r / denom) / phi;
        expected += -0.5 * (m as f64 * (2.0 * std::f64::consts::PI).ln() + log_det + quad);
    }
    assert_relative_eq!(fit.log_likelihood, expected, epsilon = 1e-6);
}

#[test]
fn test_lrt_detects_real_covariate_effect() {
    let data_full = generate_poisson(60, 8, &[1.0, 0.6], 0.5, 99);
    let family = FamilySpec::new(Arc::new(Poisson)).unwrap();
    let full = fit_glmm(&data_full, &family, &GlmmControl::default()).unwrap();

    // Reduced model: same response, intercept only.
    let n = data_full.n_obs();
    let x0 = DMatrix::from_element(n, 1, 1.0);
    let z = DMatrix::from_element(n, 1, 1.0);
    let group: Vec<String> = (0..60).flat_map(|c| vec![format!("c{}", c); 8]).collect();
    let data_reduced =
        MixedModelData::new(data_full.response().clone(), x0, group, z).unwrap();
    let reduced = fit_glmm(&data_reduced, &family, &GlmmControl::default()).unwrap();

    let result = lrt(&full, &reduced).unwrap();
    assert_eq!(result.df, 1);
    assert!(result.statistic > 0.0);
    assert!(result.p_value < 0.01, "p = {}", result.p_value);
    assert!(result.ll_full >= result.ll_reduced);
}

#[test]
fn test_lrt_of_model_against_itself() {
    let data = generate_poisson(20, 6, &[0.8], 0.4, 5);
    let family = FamilySpec::new(Arc::new(Poisson)).unwrap();
    let fit = fit_glmm(&data, &family, &GlmmControl::default()).unwrap();

    let result = lrt(&fit, &fit).unwrap();
    assert_eq!(result.df, 0);
    assert_eq!(result.statistic, 0.0);
    assert_eq!(result.p_value, 1.0);
}

#[test]
fn test_lrt_usage_errors() {
    let family = FamilySpec::new(Arc::new(Poisson)).unwrap();
    let data_a = generate_poisson(20, 6, &[0.8], 0.4, 5);
    let data_b = generate_poisson(20, 6, &[0.8], 0.4, 6);
    let fit_a = fit_glmm(&data_a, &family, &GlmmControl::default()).unwrap();
    let fit_b = fit_glmm(&data_b, &family, &GlmmControl::default()).unwrap();

    // Different data is not nested.
    assert!(matches!(lrt(&fit_a, &fit_b), Err(GlmmError::NotNested(_))));

    // Equal parameter counts with different likelihoods: not nested either.
    let data_c = generate_poisson(20, 6, &[0.8, 0.5], 0.4, 5);
    let n = data_c.n_obs();
    let group: Vec<String> = (0..20).flat_map(|c| vec![format!("c{}", c); 6]).collect();
    let z = DMatrix::from_element(n, 1, 1.0);
    // Swap the covariate for a different one, keeping the column count.
    let mut x_other = DMatrix::from_element(n, 2, 1.0);
    for i in 0..n {
        x_other[(i, 1)] = (i % 3) as f64;
    }
    let fit_c = fit_glmm(&data_c, &family, &GlmmControl::default()).unwrap();
    let data_d =
        MixedModelData::new(data_c.response().clone(), x_other, group, z).unwrap();
    let fit_d = fit_glmm(&data_d, &family, &GlmmControl::default()).unwrap();
    assert!(matches!(lrt(&fit_c, &fit_d), Err(GlmmError::NotNested(_))));

    // The reduced fit cannot have more parameters than the full fit.
    let n_a = data_a.n_obs();
    let group_a: Vec<String> = (0..20).flat_map(|c| vec![format!("c{}", c); 6]).collect();
    let mut x_wide = DMatrix::from_element(n_a, 2, 1.0);
    for i in 0..n_a {
        x_wide[(i, 1)] = (i % 2) as f64;
    }
    let data_wide = MixedModelData::new(
        data_a.response().clone(),
        x_wide,
        group_a,
        DMatrix::from_element(n_a, 1, 1.0),
    )
    .unwrap();
    let fit_wide = fit_glmm(&data_wide, &family, &GlmmControl::default()).unwrap();
    assert!(matches!(lrt(&fit_a, &fit_wide), Err(GlmmError::NotNested(_))));
}

#[test]
fn test_simulate_shapes_support_and_determinism() {
    let data = generate_poisson(20, 6, &[1.0], 0.5, 17);
    let family = FamilySpec::new(Arc::new(Poisson)).unwrap();
    let fit = fit_glmm(&data, &family, &GlmmControl::default()).unwrap();

    let sims = simulate(&fit, 1000, SimulateKind::MeanSubject, 123).unwrap();
    assert_eq!(sims.nrows(), fit.n_obs);
    assert_eq!(sims.ncols(), 1000);
    // Poisson replicates are non-negative integers.
    for v in sims.iter() {
        assert!(*v >= 0.0 && v.fract() == 0.0);
    }

    for kind in [SimulateKind::SubjectSpecific, SimulateKind::SubjectRefreshed] {
        let sims = simulate(&fit, 25, kind, 123).unwrap();
        assert_eq!(sims.nrows(), fit.n_obs);
        assert_eq!(sims.ncols(), 25);
        for v in sims.iter() {
            assert!(*v >= 0.0 && v.fract() == 0.0);
        }
    }

    let a = simulate(&fit, 10, SimulateKind::SubjectSpecific, 123).unwrap();
    let b = simulate(&fit, 10, SimulateKind::SubjectSpecific, 123).unwrap();
    let c = simulate(&fit, 10, SimulateKind::SubjectSpecific, 124).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);

    assert!(matches!(
        simulate(&fit, 0, SimulateKind::MeanSubject, 1),
        Err(GlmmError::InvalidParameter(_))
    ));
}

#[test]
fn test_simulate_without_a_simulation_law_is_a_usage_error() {
    // A custom family with no sample closure cannot feed the simulator.
    let family = FamilySpec::new(Arc::new(gaussian_family())).unwrap();
    let mut rng = Rng::new(3);
    let n = 40;
    let y = DVector::from_fn(n, |_, _| rng.next_normal(0.0, 1.0));
    let x = DMatrix::from_element(n, 1, 1.0);
    let z = DMatrix::from_element(n, 1, 1.0);
    let group: Vec<String> = (0..n).map(|i| format!("c{}", i / 4)).collect();
    let data = MixedModelData::new(y, x, group, z).unwrap();
    let fit = fit_glmm(&data, &family, &GlmmControl::default()).unwrap();

    assert!(matches!(
        simulate(&fit, 5, SimulateKind::MeanSubject, 1),
        Err(GlmmError::MissingCapability(_))
    ));
}

#[test]
fn test_zero_inflated_poisson_fit() {
    // ZIP data: structural zeros with probability invlogit(-0.5), otherwise
    // Poisson(exp(1 + b)).
    let mut rng = Rng::new(31);
    let (n_clusters, m) = (50, 8);
    let n = n_clusters * m;
    let pi = 1.0 / (1.0 + 0.5f64.exp());

    let mut y = Vec::with_capacity(n);
    let mut group = Vec::with_capacity(n);
    for c in 0..n_clusters {
        let b = rng.next_normal(0.0, 0.5);
        for _ in 0..m {
            let v = if rng.next_f64() < pi {
                0.0
            } else {
                rng.next_poisson((1.0 + b).exp()) as f64
            };
            y.push(v);
            group.push(format!("c{}", c));
        }
    }
    let x = DMatrix::from_element(n, 1, 1.0);
    let z = DMatrix::from_element(n, 1, 1.0);
    let x_zi = DMatrix::from_element(n, 1, 1.0);
    let data = MixedModelData::new(DVector::from_vec(y), x, group, z)
        .unwrap()
        .with_zero_part(x_zi, None)
        .unwrap();

    let family = FamilySpec::new(Arc::new(ZeroInflated::new(Arc::new(Poisson)))).unwrap();
    let fit = fit_glmm(&data, &family, &GlmmControl::default()).unwrap();

    assert!(fit.log_likelihood.is_finite());
    let gamma = fit.params.gamma.as_ref().unwrap();
    // Zero-inflation intercept near its true value of -0.5.
    assert!((gamma[0] + 0.5).abs() < 0.6, "gamma = {}", gamma[0]);
    assert!((fit.params.beta[0] - 1.0).abs() < 0.3, "beta = {}", fit.params.beta[0]);

    // Fitted means account for the zero process: below the Poisson mean.
    let fitted = fit.fitted(FittedKind::Population);
    let poisson_mean = fit.params.beta[0].exp();
    assert!(fitted[0] < poisson_mean);
    assert!(fitted[0] > 0.0);

    // The family/data zero-part pairing is validated both ways.
    let plain = FamilySpec::new(Arc::new(Poisson)).unwrap();
    assert!(matches!(
        fit_glmm(&data, &plain, &GlmmControl::default()),
        Err(GlmmError::InvalidParameter(_))
    ));
}

#[test]
fn test_negative_binomial_dispersion_estimation() {
    // NB data with theta = 2: clearly overdispersed relative to Poisson.
    let mut rng = Rng::new(61);
    let (n_clusters, m) = (60, 8);
    let n = n_clusters * m;
    let mut y = Vec::with_capacity(n);
    let mut group = Vec::with_capacity(n);
    for c in 0..n_clusters {
        let b = rng.next_normal(0.0, 0.4);
        for _ in 0..m {
            y.push(rng.next_negbin((1.2 + b).exp(), 2.0) as f64);
            group.push(format!("c{}", c));
        }
    }
    let x = DMatrix::from_element(n, 1, 1.0);
    let z = DMatrix::from_element(n, 1, 1.0);
    let data = MixedModelData::new(DVector::from_vec(y), x, group, z).unwrap();

    let family = FamilySpec::new(Arc::new(NegBinomial)).unwrap();
    let fit = fit_glmm(&data, &family, &GlmmControl::default()).unwrap();

    assert!((fit.params.beta[0] - 1.2).abs() < 0.3);
    let theta = fit.params.phis()[0];
    assert!(theta > 0.8 && theta < 5.0, "theta = {}", theta);

    // NB nests Poisson in the large-theta limit; with truly overdispersed
    // data the NB fit must dominate a Poisson fit on the same data.
    let poisson = fit_glmm(
        &data,
        &FamilySpec::new(Arc::new(Poisson)).unwrap(),
        &GlmmControl::default(),
    )
    .unwrap();
    assert!(fit.log_likelihood > poisson.log_likelihood);
}
