//! Response families: the pluggable distribution abstraction of the engine.

pub mod builtin;
pub mod custom;
pub mod link;
pub mod spec;
pub mod zero;

pub use builtin::{Bernoulli, Binomial, NegBinomial, Poisson};
pub use custom::{CustomFamily, CustomFamilyBuilder};
pub use link::Link;
pub use spec::{Family, FamilySpec, ScoreMode, DEFAULT_FD_STEP};
pub use zero::{Hurdle, ZeroInflated};
