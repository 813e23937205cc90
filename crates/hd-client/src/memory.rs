//! In-process control plane.
//!
//! Simulates the service side of a sweep with no external dependencies:
//! submissions are validated the way the service would, child runs are spawned
//! with sampled (or grid) assignments, and early-termination policies are
//! applied to the metrics the children report. Useful for integration tests
//! and for trying out a sweep definition before spending compute.

use async_trait::async_trait;
use hd_sweep::{JobDescription, ParameterAssignment, RunProgress, SamplingMethod};
use hd_types::{invalid_argument, HdError, HdResult, RunId, RunMetrics, RunState};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::control_plane::ControlPlane;

/// Configuration for the in-memory control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct InMemoryControlPlaneConfig {
    /// Seed for child-run sampling. `None` seeds from the OS.
    pub seed: Option<u64>,
    /// State a freshly submitted sweep starts in.
    pub initial_state: RunState,
}

impl Default for InMemoryControlPlaneConfig {
    fn default() -> Self {
        Self {
            seed: None,
            initial_state: RunState::Running,
        }
    }
}

#[derive(Debug, Clone)]
struct JobRecord {
    description: Option<JobDescription>,
    state: RunState,
    metrics: RunMetrics,
    children: Vec<RunId>,
    assignment: Option<ParameterAssignment>,
}

impl JobRecord {
    fn new(state: RunState) -> Self {
        Self {
            description: None,
            state,
            metrics: HashMap::new(),
            children: Vec::new(),
            assignment: None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    jobs: HashMap<RunId, JobRecord>,
    rng: StdRng,
    pending_rejection: Option<String>,
    transport_available: bool,
    status_polls: usize,
}

impl Inner {
    fn check_transport(&self) -> HdResult<()> {
        if self.transport_available {
            Ok(())
        } else {
            Err(HdError::Transport {
                message: "control plane unreachable".to_string(),
            })
        }
    }

    fn job(&self, id: &RunId) -> HdResult<&JobRecord> {
        self.jobs.get(id).ok_or_else(|| HdError::RunNotFound {
            run_id: id.to_string(),
        })
    }

    fn job_mut(&mut self, id: &RunId) -> HdResult<&mut JobRecord> {
        self.jobs.get_mut(id).ok_or_else(|| HdError::RunNotFound {
            run_id: id.to_string(),
        })
    }
}

/// A fully in-process control plane that simulates sweep execution.
#[derive(Debug)]
pub struct InMemoryControlPlane {
    config: InMemoryControlPlaneConfig,
    inner: Mutex<Inner>,
}

impl InMemoryControlPlane {
    pub fn new(config: InMemoryControlPlaneConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                rng,
                pending_rejection: None,
                transport_available: true,
                status_polls: 0,
            }),
        }
    }

    /// Create an in-memory control plane with default settings.
    pub fn with_defaults() -> Self {
        Self::new(InMemoryControlPlaneConfig::default())
    }

    /// Reject the next submission with `reason`, as a service quota or
    /// validation failure would.
    pub fn reject_next_submission(&self, reason: impl Into<String>) {
        self.inner.lock().pending_rejection = Some(reason.into());
    }

    /// Simulate losing (or regaining) connectivity. While unavailable every
    /// call fails with a transport error.
    pub fn set_transport_available(&self, available: bool) {
        self.inner.lock().transport_available = available;
    }

    /// Number of status queries served so far.
    pub fn status_polls(&self) -> usize {
        self.inner.lock().status_polls
    }

    /// The accepted job description of a sweep.
    pub fn job_description(&self, sweep: &RunId) -> Option<JobDescription> {
        self.inner
            .lock()
            .jobs
            .get(sweep)
            .and_then(|job| job.description.clone())
    }

    /// The hyperparameter assignment a child run was launched with.
    pub fn assignment(&self, child: &RunId) -> Option<ParameterAssignment> {
        self.inner
            .lock()
            .jobs
            .get(child)
            .and_then(|job| job.assignment.clone())
    }

    /// Launch the next child run of `sweep`.
    ///
    /// Grid sweeps walk the grid in order; other methods draw a fresh sample.
    pub fn spawn_child(&self, sweep: &RunId) -> HdResult<RunId> {
        let mut inner = self.inner.lock();
        let parent = inner.job(sweep)?;
        let description = parent
            .description
            .clone()
            .ok_or_else(|| invalid_argument!("run {sweep} is not a sweep"))?;
        let index = parent.children.len();
        if index >= description.max_total_runs as usize {
            return Err(invalid_argument!(
                "sweep {sweep} already launched max_total_runs ({}) children",
                description.max_total_runs
            ));
        }

        let sampling = &description.generator_config;
        let assignment = if sampling.method() == SamplingMethod::Grid {
            sampling
                .grid_points()?
                .into_iter()
                .nth(index)
                .ok_or_else(|| invalid_argument!("grid of sweep {sweep} is exhausted"))?
        } else {
            sampling.sample(&mut inner.rng)
        };

        let child_id = RunId::new(format!("{sweep}_{index}"));
        let mut child = JobRecord::new(RunState::Running);
        child.assignment = Some(assignment);
        inner.jobs.insert(child_id.clone(), child);
        inner.job_mut(sweep)?.children.push(child_id.clone());

        debug!(%sweep, child = %child_id, "child run spawned");
        Ok(child_id)
    }

    /// Record one metric value, appended after the ones already logged.
    pub fn log_metric(&self, run: &RunId, name: &str, value: f64) -> HdResult<()> {
        let mut inner = self.inner.lock();
        inner
            .job_mut(run)?
            .metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
        Ok(())
    }

    /// Force a run into `state`.
    pub fn set_state(&self, run: &RunId, state: RunState) -> HdResult<()> {
        let mut inner = self.inner.lock();
        inner.job_mut(run)?.state = state;
        Ok(())
    }

    /// Evaluate the sweep's early-termination policy against every active
    /// child's latest primary-metric report. Terminated children move to
    /// `Canceled`; their ids are returned.
    pub fn apply_termination_policy(&self, sweep: &RunId) -> HdResult<Vec<RunId>> {
        let mut inner = self.inner.lock();
        let parent = inner.job(sweep)?;
        let description = parent
            .description
            .as_ref()
            .ok_or_else(|| invalid_argument!("run {sweep} is not a sweep"))?;
        let policy = &description.policy_config;
        let policy_kind = policy.kind().as_str();
        let metric = &description.primary_metric_config;

        let empty: Vec<f64> = Vec::new();
        let histories: Vec<(&RunId, &[f64], RunState)> = parent
            .children
            .iter()
            .filter_map(|id| inner.jobs.get(id).map(|child| (id, child)))
            .map(|(id, child)| {
                let values = child.metrics.get(&metric.name).unwrap_or(&empty);
                (id, values.as_slice(), child.state)
            })
            .collect();

        let mut terminated = Vec::new();
        for (i, (id, values, state)) in histories.iter().enumerate() {
            if state.is_terminal() || values.is_empty() {
                continue;
            }
            let peers: Vec<RunProgress<'_>> = histories
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, (_, values, state))| RunProgress {
                    values: *values,
                    finished: state.is_terminal(),
                })
                .collect();
            if policy.should_terminate(metric.goal, values, &peers) {
                terminated.push((*id).clone());
            }
        }

        for id in &terminated {
            inner.job_mut(id)?.state = RunState::Canceled;
            info!(%sweep, child = %id, policy = policy_kind, "child run terminated early");
        }
        Ok(terminated)
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn submit_job(&self, job: &serde_json::Value) -> HdResult<RunId> {
        let mut inner = self.inner.lock();
        inner.check_transport()?;
        if let Some(reason) = inner.pending_rejection.take() {
            return Err(HdError::SubmissionRejected { reason });
        }

        let description = JobDescription::from_value(job.clone())
            .and_then(|d| d.to_run_configuration().map(|_| d))
            .map_err(|e| HdError::SubmissionRejected {
                reason: e.to_string(),
            })?;

        let id = RunId::new(format!("HD_{}", Uuid::new_v4().simple()));
        let mut record = JobRecord::new(self.config.initial_state);
        info!(
            run_id = %id,
            experiment = %description.experiment_name,
            sampling = %description.generator_config.method(),
            max_total_runs = description.max_total_runs,
            "sweep accepted"
        );
        record.description = Some(description);
        inner.jobs.insert(id.clone(), record);
        Ok(id)
    }

    async fn get_job_status(&self, job_id: &RunId) -> HdResult<RunState> {
        let mut inner = self.inner.lock();
        inner.check_transport()?;
        inner.status_polls += 1;
        Ok(inner.job(job_id)?.state)
    }

    async fn get_job_metrics(&self, job_id: &RunId) -> HdResult<RunMetrics> {
        let inner = self.inner.lock();
        inner.check_transport()?;
        Ok(inner.job(job_id)?.metrics.clone())
    }

    async fn list_child_jobs(&self, job_id: &RunId) -> HdResult<Vec<RunId>> {
        let inner = self.inner.lock();
        inner.check_transport()?;
        Ok(inner.job(job_id)?.children.clone())
    }
}
