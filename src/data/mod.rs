//! Core data structures: model data, clusters, and parameter vectors.

pub mod cluster;
pub mod parameters;

pub use cluster::{Cluster, MixedModelData};
pub use parameters::{ParamLayout, ParameterVector};
