//! Run configuration: everything a sweep submission needs, validated up front.

use hd_types::{config_error, invalid_argument, HdResult, MetricGoal, PrimaryMetric};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::policy::TerminationPolicy;
use crate::sampling::{SamplingMethod, SamplingStrategy};

/// Seven days, the platform's default sweep budget.
pub const DEFAULT_MAX_DURATION_MINUTES: u32 = 10_080;

/// What each child run executes: script, environment, compute.
///
/// Stored as opaque JSON so this crate doesn't depend on the platform's
/// job-definition models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTarget {
    /// Human-readable label (e.g. "train.py on gpu-cluster").
    pub name: String,
    #[serde(default)]
    pub descriptor: serde_json::Value,
}

impl ExecutionTarget {
    pub fn new(name: impl Into<String>, descriptor: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            descriptor,
        }
    }
}

/// A complete, validated hyperparameter sweep definition.
///
/// Owns its sampling strategy and policy; shares the execution target.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration {
    target: Arc<ExecutionTarget>,
    sampling: SamplingStrategy,
    policy: TerminationPolicy,
    primary_metric: PrimaryMetric,
    max_total_runs: u32,
    max_concurrent_runs: u32,
    max_duration_minutes: u32,
}

impl RunConfiguration {
    /// Start a configuration from its required parts.
    pub fn builder(
        target: Arc<ExecutionTarget>,
        sampling: SamplingStrategy,
        primary_metric_name: impl Into<String>,
        primary_metric_goal: MetricGoal,
        max_total_runs: u32,
    ) -> RunConfigurationBuilder {
        RunConfigurationBuilder {
            target,
            sampling,
            primary_metric_name: primary_metric_name.into(),
            primary_metric_goal,
            max_total_runs,
            policy: None,
            max_concurrent_runs: None,
            max_duration_minutes: None,
        }
    }

    pub fn target(&self) -> &Arc<ExecutionTarget> {
        &self.target
    }

    pub fn sampling(&self) -> &SamplingStrategy {
        &self.sampling
    }

    pub fn policy(&self) -> &TerminationPolicy {
        &self.policy
    }

    pub fn primary_metric(&self) -> &PrimaryMetric {
        &self.primary_metric
    }

    pub fn max_total_runs(&self) -> u32 {
        self.max_total_runs
    }

    pub fn max_concurrent_runs(&self) -> u32 {
        self.max_concurrent_runs
    }

    pub fn max_duration_minutes(&self) -> u32 {
        self.max_duration_minutes
    }
}

/// Optional settings for a [`RunConfiguration`].
#[derive(Debug, Clone)]
pub struct RunConfigurationBuilder {
    target: Arc<ExecutionTarget>,
    sampling: SamplingStrategy,
    primary_metric_name: String,
    primary_metric_goal: MetricGoal,
    max_total_runs: u32,
    policy: Option<TerminationPolicy>,
    max_concurrent_runs: Option<u32>,
    max_duration_minutes: Option<u32>,
}

impl RunConfigurationBuilder {
    pub fn with_policy(mut self, policy: TerminationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Defaults to `max_total_runs`.
    pub fn with_max_concurrent_runs(mut self, n: u32) -> Self {
        self.max_concurrent_runs = Some(n);
        self
    }

    /// Defaults to [`DEFAULT_MAX_DURATION_MINUTES`].
    pub fn with_max_duration_minutes(mut self, minutes: u32) -> Self {
        self.max_duration_minutes = Some(minutes);
        self
    }

    pub fn build(self) -> HdResult<RunConfiguration> {
        let primary_metric = PrimaryMetric::new(self.primary_metric_name, self.primary_metric_goal)?;

        if self.max_total_runs == 0 {
            return Err(invalid_argument!("max_total_runs must be positive"));
        }
        let max_concurrent_runs = self.max_concurrent_runs.unwrap_or(self.max_total_runs);
        if max_concurrent_runs == 0 {
            return Err(invalid_argument!("max_concurrent_runs must be positive"));
        }
        if max_concurrent_runs > self.max_total_runs {
            return Err(invalid_argument!(
                "max_concurrent_runs ({max_concurrent_runs}) exceeds max_total_runs ({})",
                self.max_total_runs
            ));
        }
        let max_duration_minutes = self
            .max_duration_minutes
            .unwrap_or(DEFAULT_MAX_DURATION_MINUTES);
        if max_duration_minutes == 0 {
            return Err(invalid_argument!("max_duration_minutes must be positive"));
        }

        let policy = self.policy.unwrap_or_default();
        policy.validate()?;
        if self.sampling.method() == SamplingMethod::Bayesian && policy != TerminationPolicy::None {
            return Err(invalid_argument!(
                "Bayesian sampling does not support early termination; use no policy"
            ));
        }

        if let Some(grid_size) = self.sampling.grid_size() {
            if self.sampling.method() == SamplingMethod::Grid
                && self.max_total_runs as usize > grid_size
            {
                warn!(
                    grid_size,
                    max_total_runs = self.max_total_runs,
                    "max_total_runs exceeds the grid size; the service runs each grid point once"
                );
            }
        }

        debug!(
            sampling = %self.sampling.method(),
            policy = policy.kind().as_str(),
            metric = %primary_metric.name,
            max_total_runs = self.max_total_runs,
            max_concurrent_runs,
            "run configuration built"
        );

        Ok(RunConfiguration {
            target: self.target,
            sampling: self.sampling,
            policy,
            primary_metric,
            max_total_runs: self.max_total_runs,
            max_concurrent_runs,
            max_duration_minutes,
        })
    }
}

// ---------------------------------------------------------------------------
// Sweep files
// ---------------------------------------------------------------------------

/// On-disk sweep definition (JSON).
///
/// ```json
/// {
///   "execution_target": {"name": "train.py", "descriptor": {"compute": "gpu"}},
///   "sampling": {"parameter_space": {"lr": ["uniform", [0.001, 0.1]]}, "sampling_method": "RANDOM"},
///   "policy": {"name": "BANDIT", "properties": {"slack_factor": 0.1}},
///   "primary_metric": {"name": "accuracy", "goal": "MAXIMIZE"},
///   "max_total_runs": 20,
///   "max_concurrent_runs": 4
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepFile {
    pub execution_target: ExecutionTarget,
    pub sampling: SamplingStrategy,
    #[serde(default)]
    pub policy: TerminationPolicy,
    pub primary_metric: PrimaryMetric,
    pub max_total_runs: u32,
    #[serde(default)]
    pub max_concurrent_runs: Option<u32>,
    #[serde(default)]
    pub max_duration_minutes: Option<u32>,
}

impl SweepFile {
    pub fn from_json_str(text: &str) -> HdResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a sweep file. Parse failures carry the path.
    pub fn load(path: impl AsRef<Path>) -> HdResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| config_error!("invalid sweep file {}: {e}", path.display()))
    }

    pub fn into_run_configuration(self) -> HdResult<RunConfiguration> {
        let mut builder = RunConfiguration::builder(
            Arc::new(self.execution_target),
            self.sampling,
            self.primary_metric.name,
            self.primary_metric.goal,
            self.max_total_runs,
        )
        .with_policy(self.policy);
        if let Some(n) = self.max_concurrent_runs {
            builder = builder.with_max_concurrent_runs(n);
        }
        if let Some(minutes) = self.max_duration_minutes {
            builder = builder.with_max_duration_minutes(minutes);
        }
        builder.build()
    }
}
