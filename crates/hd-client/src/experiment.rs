//! Experiments: the named context every sweep is submitted under.

use hd_sweep::{JobDescription, RunConfiguration};
use hd_types::{invalid_argument, HdResult};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::control_plane::ControlPlane;
use crate::run::RunHandle;

const MAX_NAME_LEN: usize = 255;

/// A named experiment bound to the control plane that records it.
///
/// Cheap to clone; clones share the control plane.
#[derive(Clone)]
pub struct Experiment {
    name: String,
    control_plane: Arc<dyn ControlPlane>,
}

impl Experiment {
    /// Names are 1-255 ASCII letters, digits, `-` or `_`, starting with a
    /// letter or digit.
    pub fn new(name: impl Into<String>, control_plane: Arc<dyn ControlPlane>) -> HdResult<Self> {
        let name = name.into();
        let starts_alnum = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric());
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !starts_alnum || !valid_chars || name.len() > MAX_NAME_LEN {
            return Err(invalid_argument!("invalid experiment name '{name}'"));
        }
        Ok(Self {
            name,
            control_plane,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control_plane(&self) -> &Arc<dyn ControlPlane> {
        &self.control_plane
    }

    /// Submit a sweep. Returns as soon as the control plane has accepted it.
    ///
    /// Every call creates a new remote run, even for an identical
    /// configuration.
    pub async fn submit(&self, config: &RunConfiguration) -> HdResult<RunHandle> {
        let job = JobDescription::new(&self.name, config).to_value()?;
        let run_id = self.control_plane.submit_job(&job).await?;
        info!(
            experiment = %self.name,
            %run_id,
            sampling = %config.sampling().method(),
            max_total_runs = config.max_total_runs(),
            "sweep submitted"
        );
        Ok(RunHandle::submitted(
            self.clone(),
            run_id,
            config.primary_metric().clone(),
        ))
    }
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryControlPlane;
    use hd_sweep::{Distribution, ExecutionTarget, ParameterSpace, SamplingStrategy};
    use hd_types::{HdError, MetricGoal, RunState};
    use serde_json::json;

    fn control_plane() -> Arc<InMemoryControlPlane> {
        Arc::new(InMemoryControlPlane::with_defaults())
    }

    fn config() -> RunConfiguration {
        let sampling = SamplingStrategy::random(
            ParameterSpace::new().with("lr", Distribution::loguniform(-6.0, -1.0).unwrap()),
        )
        .unwrap();
        RunConfiguration::builder(
            Arc::new(ExecutionTarget::new("train.py", json!({}))),
            sampling,
            "loss",
            MetricGoal::Minimize,
            10,
        )
        .with_max_concurrent_runs(2)
        .build()
        .unwrap()
    }

    #[test]
    fn test_experiment_name_rules() {
        let cp = control_plane();
        assert!(Experiment::new("mnist-sweep_01", cp.clone()).is_ok());
        assert!(Experiment::new("", cp.clone()).is_err());
        assert!(Experiment::new("-leading", cp.clone()).is_err());
        assert!(Experiment::new("has space", cp.clone()).is_err());
        assert!(Experiment::new("x".repeat(256), cp).is_err());
    }

    #[tokio::test]
    async fn test_submit_returns_running_handle() {
        let cp = control_plane();
        let experiment = Experiment::new("mnist", cp.clone()).unwrap();

        let handle = experiment.submit(&config()).await.unwrap();
        assert_eq!(handle.experiment().name(), "mnist");
        assert_eq!(handle.primary_metric().goal, MetricGoal::Minimize);
        assert_eq!(handle.poll_status().await.unwrap(), RunState::Running);

        let recorded = cp.job_description(handle.id()).unwrap();
        assert_eq!(recorded.experiment_name, "mnist");
        assert_eq!(recorded.max_concurrent_runs, 2);
    }

    #[tokio::test]
    async fn test_each_submit_creates_a_new_run() {
        let experiment = Experiment::new("mnist", control_plane()).unwrap();
        let a = experiment.submit(&config()).await.unwrap();
        let b = experiment.submit(&config()).await.unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_rejection_and_transport_errors_surface() {
        let cp = control_plane();
        let experiment = Experiment::new("mnist", cp.clone()).unwrap();

        cp.reject_next_submission("quota exceeded for gpu-cluster");
        match experiment.submit(&config()).await {
            Err(HdError::SubmissionRejected { reason }) => {
                assert_eq!(reason, "quota exceeded for gpu-cluster")
            }
            other => panic!("expected SubmissionRejected, got {other:?}"),
        }

        cp.set_transport_available(false);
        let err = experiment.submit(&config()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
