pub mod aws;
pub mod cache;
pub mod cli;
pub mod config;
pub mod eviction;
pub mod k8s;
pub mod metrics;
pub mod model;
pub mod query;
pub mod reconciler;
pub mod signal;
