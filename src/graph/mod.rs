//! Dependency graph, readiness and failure propagation

mod dag;

pub use dag::{DependencyGraph, Propagation};
