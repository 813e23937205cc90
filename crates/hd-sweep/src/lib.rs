//! # hd-sweep
//!
//! Hyperparameter sweep model for hyperdrive.
//!
//! Provides distribution descriptors, sampling strategies (random, grid,
//! Bayesian), early-termination policies, and the validated run configuration
//! that serializes into the job description a control plane accepts.

mod config;
mod distribution;
mod job;
mod policy;
mod sampling;

pub use config::{
    ExecutionTarget, RunConfiguration, RunConfigurationBuilder, SweepFile,
    DEFAULT_MAX_DURATION_MINUTES,
};
pub use distribution::{Distribution, DistributionKind};
pub use job::JobDescription;
pub use policy::{Cadence, PolicyKind, PolicyParams, RunProgress, Slack, TerminationPolicy};
pub use sampling::{ParameterAssignment, ParameterSpace, SamplingMethod, SamplingStrategy};
