//! Deterministic seeded random number generation.
//!
//! The simulator is the only component of the engine with mutable random
//! state, and it must be explicitly seedable so repeated runs are
//! reproducible. A small xorshift64 generator with the handful of samplers
//! the response families need is sufficient; no global state is involved.

/// Simple deterministic RNG (xorshift64).
#[derive(Debug, Clone)]
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform draw on [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Normal draw via Box-Muller.
    pub fn next_normal(&mut self, mean: f64, std: f64) -> f64 {
        let u1 = self.next_f64().max(1e-12);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std * z
    }

    /// Bernoulli draw with success probability `p`.
    pub fn next_bernoulli(&mut self, p: f64) -> f64 {
        if self.next_f64() < p { 1.0 } else { 0.0 }
    }

    /// Binomial draw: number of successes in `n` trials with probability `p`.
    pub fn next_binomial(&mut self, n: u64, p: f64) -> u64 {
        (0..n).filter(|_| self.next_f64() < p).count() as u64
    }

    /// Poisson draw: direct method for small rates, normal approximation
    /// above 30 where the direct product underflows.
    pub fn next_poisson(&mut self, lambda: f64) -> u64 {
        if lambda <= 0.0 {
            return 0;
        }
        if lambda < 30.0 {
            let l = (-lambda).exp();
            let mut k = 0u64;
            let mut p = 1.0;
            loop {
                k += 1;
                p *= self.next_f64();
                if p <= l {
                    return k - 1;
                }
            }
        } else {
            let sample = self.next_normal(lambda, lambda.sqrt());
            sample.max(0.0).round() as u64
        }
    }

    /// Gamma draw, Marsaglia-Tsang for shape >= 1 with the Ahrens-Dieter
    /// boost for shape < 1.
    pub fn next_gamma(&mut self, shape: f64, scale: f64) -> f64 {
        if shape < 1.0 {
            let u = self.next_f64().max(1e-12);
            return self.next_gamma(shape + 1.0, scale) * u.powf(1.0 / shape);
        }

        let d = shape - 1.0 / 3.0;
        let c = 1.0 / (9.0 * d).sqrt();

        loop {
            let x = self.next_normal(0.0, 1.0);
            let v = (1.0 + c * x).powi(3);

            if v > 0.0 {
                let u = self.next_f64();
                if u < 1.0 - 0.0331 * x.powi(4) {
                    return d * v * scale;
                }
                if u.ln() < 0.5 * x.powi(2) + d * (1.0 - v + v.ln()) {
                    return d * v * scale;
                }
            }
        }
    }

    /// Negative binomial draw as a gamma-Poisson mixture with mean `mean`
    /// and size parameter `theta` (variance `mean + mean^2 / theta`).
    pub fn next_negbin(&mut self, mean: f64, theta: f64) -> u64 {
        if mean <= 0.0 {
            return 0;
        }
        let rate = self.next_gamma(theta, mean / theta);
        self.next_poisson(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let mut a = Rng::new(42);
        let mut b = Rng::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn test_uniform_range() {
        let mut rng = Rng::new(7);
        for _ in 0..1000 {
            let u = rng.next_f64();
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn test_poisson_mean() {
        let mut rng = Rng::new(3);
        let n = 5000;
        let mean: f64 = (0..n).map(|_| rng.next_poisson(4.0) as f64).sum::<f64>() / n as f64;
        assert!((mean - 4.0).abs() < 0.2, "Poisson mean off: {}", mean);
    }

    #[test]
    fn test_negbin_overdispersion() {
        let mut rng = Rng::new(11);
        let n = 5000;
        let draws: Vec<f64> = (0..n).map(|_| rng.next_negbin(5.0, 2.0) as f64).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        assert!((mean - 5.0).abs() < 0.4, "NB mean off: {}", mean);
        // Variance should exceed the mean (expected 5 + 25/2 = 17.5).
        assert!(var > mean, "NB draws not overdispersed: var {} mean {}", var, mean);
    }

    #[test]
    fn test_binomial_bounds() {
        let mut rng = Rng::new(5);
        for _ in 0..200 {
            let k = rng.next_binomial(10, 0.3);
            assert!(k <= 10);
        }
    }
}
