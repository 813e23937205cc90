//! The serialized job description handed to the control plane.

use hd_types::{HdResult, PrimaryMetric};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{ExecutionTarget, RunConfiguration};
use crate::policy::TerminationPolicy;
use crate::sampling::SamplingStrategy;

/// Everything the service needs to run a sweep, in wire form.
///
/// Deserializing re-checks the sampling strategy and policy;
/// [`JobDescription::to_run_configuration`] re-checks the run limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    /// Experiment the sweep is recorded under.
    pub experiment_name: String,

    pub primary_metric_config: PrimaryMetric,

    pub max_total_runs: u32,
    pub max_concurrent_runs: u32,
    pub max_duration_minutes: u32,

    /// `{"parameter_space": {...}, "sampling_method": ...}`
    pub generator_config: SamplingStrategy,

    pub policy_config: TerminationPolicy,

    /// Opaque execution target, passed through untouched.
    pub platform_config: ExecutionTarget,
}

impl JobDescription {
    pub fn new(experiment_name: impl Into<String>, config: &RunConfiguration) -> Self {
        Self {
            experiment_name: experiment_name.into(),
            primary_metric_config: config.primary_metric().clone(),
            max_total_runs: config.max_total_runs(),
            max_concurrent_runs: config.max_concurrent_runs(),
            max_duration_minutes: config.max_duration_minutes(),
            generator_config: config.sampling().clone(),
            policy_config: config.policy().clone(),
            platform_config: config.target().as_ref().clone(),
        }
    }

    pub fn to_value(&self) -> HdResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> HdResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Rebuild the validated configuration this description encodes.
    pub fn to_run_configuration(&self) -> HdResult<RunConfiguration> {
        RunConfiguration::builder(
            Arc::new(self.platform_config.clone()),
            self.generator_config.clone(),
            self.primary_metric_config.name.clone(),
            self.primary_metric_config.goal,
            self.max_total_runs,
        )
        .with_policy(self.policy_config.clone())
        .with_max_concurrent_runs(self.max_concurrent_runs)
        .with_max_duration_minutes(self.max_duration_minutes)
        .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::Distribution;
    use crate::policy::PolicyParams;
    use crate::sampling::ParameterSpace;
    use hd_types::MetricGoal;
    use serde_json::json;

    fn sample_config() -> RunConfiguration {
        let sampling = SamplingStrategy::random(
            ParameterSpace::new()
                .with("batch_size", Distribution::choice([16, 32, 64]).unwrap())
                .with("lr", Distribution::normal(0.0001, 0.005).unwrap()),
        )
        .unwrap();
        let target = Arc::new(ExecutionTarget::new("train.py", json!({"compute": "gpu"})));

        RunConfiguration::builder(target, sampling, "accuracy", MetricGoal::Maximize, 20)
            .with_policy(TerminationPolicy::bandit(&PolicyParams::new().slack_factor(0.15)).unwrap())
            .with_max_concurrent_runs(4)
            .with_max_duration_minutes(120)
            .build()
            .unwrap()
    }

    #[test]
    fn job_description_wire_shape() {
        let job = JobDescription::new("mnist-sweep", &sample_config());
        let value = job.to_value().unwrap();

        assert_eq!(value["experiment_name"], json!("mnist-sweep"));
        assert_eq!(
            value["primary_metric_config"],
            json!({"name": "accuracy", "goal": "MAXIMIZE"})
        );
        assert_eq!(value["max_concurrent_runs"], json!(4));
        assert_eq!(value["generator_config"]["sampling_method"], json!("RANDOM"));
        assert_eq!(
            value["generator_config"]["parameter_space"]["batch_size"],
            json!(["choice", [[16, 32, 64]]])
        );
        assert_eq!(value["policy_config"]["name"], json!("BANDIT"));
        assert_eq!(value["platform_config"]["descriptor"], json!({"compute": "gpu"}));
    }

    #[test]
    fn parameter_space_keeps_declaration_order() {
        let sampling = SamplingStrategy::random(
            ParameterSpace::new()
                .with("zeta", Distribution::randint(3).unwrap())
                .with("alpha", Distribution::uniform(0.0, 1.0).unwrap()),
        )
        .unwrap();
        let target = Arc::new(ExecutionTarget::new("train.py", json!({})));
        let config = RunConfiguration::builder(target, sampling, "loss", MetricGoal::Minimize, 5)
            .build()
            .unwrap();

        let value = JobDescription::new("ordered", &config).to_value().unwrap();
        let keys: Vec<&str> = value["generator_config"]["parameter_space"]
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, ["zeta", "alpha"]);
    }

    #[test]
    fn job_description_round_trip() {
        let config = sample_config();
        let job = JobDescription::new("mnist-sweep", &config);
        let back = JobDescription::from_value(job.to_value().unwrap()).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.to_run_configuration().unwrap(), config);
    }

    #[test]
    fn malformed_limits_fail_reconstruction() {
        let mut job = JobDescription::new("mnist-sweep", &sample_config());
        job.max_concurrent_runs = 50;
        assert!(job.to_run_configuration().is_err());
    }

    #[test]
    fn malformed_sampling_fails_parsing() {
        let mut value = JobDescription::new("mnist-sweep", &sample_config())
            .to_value()
            .unwrap();
        value["generator_config"]["sampling_method"] = json!("GRID");
        assert!(JobDescription::from_value(value).is_err());
    }
}
