//! Handles to submitted sweeps: status, waiting, and child-run metrics.

use chrono::{DateTime, Utc};
use hd_types::{HdError, HdResult, PrimaryMetric, RunId, RunMetrics, RunState};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::experiment::Experiment;
use crate::progress::{LogProgress, NoProgress, ProgressReporter, WaitOptions};

/// One child run of a sweep together with its primary-metric value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildRunSummary {
    pub run_id: RunId,
    /// Position in the control plane's child listing.
    pub submission_index: usize,
    pub state: RunState,
    /// Last finite value reported for the primary metric, if any.
    pub primary_metric_value: Option<f64>,
    pub metrics: RunMetrics,
}

/// A submitted sweep.
///
/// Holds no remote state of its own; every query goes to the control plane.
/// Clones refer to the same remote run and may be used from different tasks.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: RunId,
    experiment: Experiment,
    primary_metric: PrimaryMetric,
    submitted_at: Option<DateTime<Utc>>,
}

enum Wake {
    Tick,
    Cancelled,
    SenderGone,
}

impl RunHandle {
    pub(crate) fn submitted(
        experiment: Experiment,
        run_id: RunId,
        primary_metric: PrimaryMetric,
    ) -> Self {
        Self {
            run_id,
            experiment,
            primary_metric,
            submitted_at: Some(Utc::now()),
        }
    }

    /// Re-attach to a sweep submitted earlier, e.g. by another process.
    pub fn attach(experiment: Experiment, run_id: RunId, primary_metric: PrimaryMetric) -> Self {
        Self {
            run_id,
            experiment,
            primary_metric,
            submitted_at: None,
        }
    }

    pub fn id(&self) -> &RunId {
        &self.run_id
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn primary_metric(&self) -> &PrimaryMetric {
        &self.primary_metric
    }

    /// When this handle submitted the run. `None` for attached handles.
    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    /// Current remote state.
    pub async fn poll_status(&self) -> HdResult<RunState> {
        self.experiment
            .control_plane()
            .get_job_status(&self.run_id)
            .await
    }

    /// Block until the sweep reaches a terminal state, polling every
    /// [`crate::progress::DEFAULT_POLL_INTERVAL`].
    pub async fn wait_for_completion(&self, show_progress: bool) -> HdResult<RunState> {
        let options = WaitOptions::default();
        if show_progress {
            self.wait_with(&options, &LogProgress, None).await
        } else {
            self.wait_with(&options, &NoProgress, None).await
        }
    }

    /// Poll until the sweep reaches a terminal state.
    ///
    /// Sending `true` on `cancel` (or dropping the returned future) ends the
    /// wait with `WaitCancelled`; the remote run keeps going either way. A
    /// timeout in `options` ends it with `WaitTimedOut`.
    pub async fn wait_with(
        &self,
        options: &WaitOptions,
        progress: &dyn ProgressReporter,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> HdResult<RunState> {
        let started = Instant::now();
        let mut last_seen: Option<RunState> = None;

        loop {
            if cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                return Err(self.cancelled());
            }

            let state = self.poll_status().await?;
            progress.on_poll(&self.run_id, state);
            if last_seen != Some(state) {
                progress.on_state_change(&self.run_id, state, started.elapsed());
                last_seen = Some(state);
            }
            if state.is_terminal() {
                debug!(run_id = %self.run_id, %state, "wait finished");
                return Ok(state);
            }

            let mut sleep_for = options.poll_interval();
            if let Some(timeout) = options.timeout() {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    return Err(HdError::WaitTimedOut {
                        run_id: self.run_id.to_string(),
                        waited_secs: elapsed.as_secs(),
                    });
                }
                sleep_for = sleep_for.min(timeout - elapsed);
            }

            let wake = match cancel.as_mut() {
                Some(rx) => tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => Wake::Tick,
                    changed = rx.changed() => match changed {
                        Ok(()) if *rx.borrow() => Wake::Cancelled,
                        Ok(()) => Wake::Tick,
                        Err(_) => Wake::SenderGone,
                    },
                },
                None => {
                    tokio::time::sleep(sleep_for).await;
                    Wake::Tick
                }
            };
            match wake {
                Wake::Tick => {}
                Wake::Cancelled => return Err(self.cancelled()),
                Wake::SenderGone => {
                    cancel = None;
                    tokio::time::sleep(sleep_for).await;
                }
            }
        }
    }

    fn cancelled(&self) -> HdError {
        info!(run_id = %self.run_id, "wait cancelled; remote run continues");
        HdError::WaitCancelled {
            run_id: self.run_id.to_string(),
        }
    }

    /// Every child run with its metrics, best primary-metric value first.
    ///
    /// Children without a finite primary-metric value sort last. Ties keep
    /// submission order.
    pub async fn list_child_runs_sorted_by_primary_metric(
        &self,
    ) -> HdResult<Vec<ChildRunSummary>> {
        let control_plane = self.experiment.control_plane();
        let children = control_plane.list_child_jobs(&self.run_id).await?;

        let mut summaries = Vec::with_capacity(children.len());
        for (submission_index, run_id) in children.into_iter().enumerate() {
            let state = control_plane.get_job_status(&run_id).await?;
            let metrics = control_plane.get_job_metrics(&run_id).await?;
            let primary_metric_value = metrics
                .get(&self.primary_metric.name)
                .and_then(|values| values.iter().rev().find(|v| v.is_finite()).copied());
            summaries.push(ChildRunSummary {
                run_id,
                submission_index,
                state,
                primary_metric_value,
                metrics,
            });
        }

        let goal = self.primary_metric.goal;
        summaries.sort_by(|a, b| match (a.primary_metric_value, b.primary_metric_value) {
            (Some(x), Some(y)) => goal.compare(x, y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        debug!(run_id = %self.run_id, children = summaries.len(), "child runs ranked");
        Ok(summaries)
    }

    /// The child run with the best primary-metric value.
    pub async fn best_child_run(&self) -> HdResult<ChildRunSummary> {
        self.list_child_runs_sorted_by_primary_metric()
            .await?
            .into_iter()
            .next()
            .filter(|child| child.primary_metric_value.is_some())
            .ok_or_else(|| HdError::NoCompletedRuns {
                run_id: self.run_id.to_string(),
            })
    }

    /// Every metric of every child run, keyed by child id.
    pub async fn child_run_metrics(&self) -> HdResult<HashMap<RunId, RunMetrics>> {
        let control_plane = self.experiment.control_plane();
        let mut all = HashMap::new();
        for child in control_plane.list_child_jobs(&self.run_id).await? {
            let metrics = control_plane.get_job_metrics(&child).await?;
            all.insert(child, metrics);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::ControlPlane;
    use crate::memory::{InMemoryControlPlane, InMemoryControlPlaneConfig};
    use hd_sweep::{
        Distribution, ExecutionTarget, ParameterSpace, RunConfiguration, SamplingStrategy,
    };
    use hd_types::MetricGoal;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(goal: MetricGoal, total: u32) -> (Arc<InMemoryControlPlane>, RunConfiguration) {
        let cp = Arc::new(InMemoryControlPlane::new(InMemoryControlPlaneConfig {
            seed: Some(7),
            ..Default::default()
        }));
        let sampling = SamplingStrategy::random(
            ParameterSpace::new().with("lr", Distribution::uniform(0.001, 0.1).unwrap()),
        )
        .unwrap();
        let config = RunConfiguration::builder(
            Arc::new(ExecutionTarget::new("train.py", json!({}))),
            sampling,
            "accuracy",
            goal,
            total,
        )
        .build()
        .unwrap();
        (cp, config)
    }

    async fn submit(cp: &Arc<InMemoryControlPlane>, config: &RunConfiguration) -> RunHandle {
        let control_plane: Arc<dyn ControlPlane> = cp.clone();
        Experiment::new("exp", control_plane)
            .unwrap()
            .submit(config)
            .await
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<RunState>>,
    }

    impl ProgressReporter for Recorder {
        fn on_state_change(&self, _run_id: &RunId, state: RunState, _elapsed: Duration) {
            self.states.lock().push(state);
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_terminal_state() {
        let (cp, config) = setup(MetricGoal::Maximize, 4);
        let handle = submit(&cp, &config).await;

        let remote = cp.clone();
        let id = handle.id().clone();
        tokio::spawn(async move {
            tokio::time::sleep(secs(25)).await;
            remote.set_state(&id, RunState::Completed).unwrap();
        });

        let recorder = Recorder::default();
        let options = WaitOptions::new(secs(10)).unwrap();
        let state = handle.wait_with(&options, &recorder, None).await.unwrap();

        assert_eq!(state, RunState::Completed);
        assert_eq!(*recorder.states.lock(), vec![RunState::Running, RunState::Completed]);
        // polls at 0s, 10s, 20s, 30s
        assert_eq!(cp.status_polls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_on_finished_run_returns_immediately() {
        let (cp, config) = setup(MetricGoal::Maximize, 4);
        let handle = submit(&cp, &config).await;
        cp.set_state(handle.id(), RunState::Failed).unwrap();

        assert_eq!(handle.wait_for_completion(true).await.unwrap(), RunState::Failed);
        assert_eq!(cp.status_polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_wait_but_not_the_run() {
        let (cp, config) = setup(MetricGoal::Maximize, 4);
        let handle = submit(&cp, &config).await;
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(secs(15)).await;
            let _ = tx.send(true);
        });

        let options = WaitOptions::new(secs(10)).unwrap();
        let err = handle.wait_with(&options, &NoProgress, Some(rx)).await.unwrap_err();
        assert!(matches!(err, HdError::WaitCancelled { .. }));
        assert_eq!(handle.poll_status().await.unwrap(), RunState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_cancel_sender_keeps_waiting() {
        let (cp, config) = setup(MetricGoal::Maximize, 4);
        let handle = submit(&cp, &config).await;
        let (tx, rx) = watch::channel(false);
        drop(tx);

        let remote = cp.clone();
        let id = handle.id().clone();
        tokio::spawn(async move {
            tokio::time::sleep(secs(5)).await;
            remote.set_state(&id, RunState::Canceled).unwrap();
        });

        let options = WaitOptions::new(secs(10)).unwrap();
        let state = handle.wait_with(&options, &NoProgress, Some(rx)).await.unwrap();
        assert_eq!(state, RunState::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let (cp, config) = setup(MetricGoal::Maximize, 4);
        let handle = submit(&cp, &config).await;

        let options = WaitOptions::new(secs(10)).unwrap().with_timeout(secs(25));
        match handle.wait_with(&options, &NoProgress, None).await {
            Err(HdError::WaitTimedOut { waited_secs, .. }) => assert_eq!(waited_secs, 25),
            other => panic!("expected WaitTimedOut, got {other:?}"),
        }
        assert_eq!(handle.poll_status().await.unwrap(), RunState::Running);
    }

    #[tokio::test]
    async fn test_children_ranked_by_goal() {
        let (cp, config) = setup(MetricGoal::Maximize, 4);
        let handle = submit(&cp, &config).await;
        let children: Vec<RunId> = (0..4).map(|_| cp.spawn_child(handle.id()).unwrap()).collect();

        cp.log_metric(&children[0], "accuracy", 0.70).unwrap();
        cp.log_metric(&children[1], "accuracy", 0.95).unwrap();
        cp.log_metric(&children[1], "accuracy", 0.91).unwrap();
        // children[2] never reports
        cp.log_metric(&children[3], "accuracy", 0.80).unwrap();
        cp.set_state(&children[3], RunState::Completed).unwrap();

        let ranked = handle.list_child_runs_sorted_by_primary_metric().await.unwrap();
        let order: Vec<usize> = ranked.iter().map(|c| c.submission_index).collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
        assert_eq!(ranked[0].primary_metric_value, Some(0.91));
        assert_eq!(ranked[0].metrics["accuracy"], vec![0.95, 0.91]);
        assert_eq!(ranked[1].state, RunState::Completed);
        assert_eq!(ranked[3].primary_metric_value, None);

        let best = handle.best_child_run().await.unwrap();
        assert_eq!(best.run_id, children[1]);
    }

    #[tokio::test]
    async fn test_minimize_ties_keep_submission_order() {
        let (cp, config) = setup(MetricGoal::Minimize, 3);
        let handle = submit(&cp, &config).await;
        let children: Vec<RunId> = (0..3).map(|_| cp.spawn_child(handle.id()).unwrap()).collect();

        cp.log_metric(&children[0], "accuracy", 0.5).unwrap();
        cp.log_metric(&children[1], "accuracy", 0.2).unwrap();
        cp.log_metric(&children[2], "accuracy", 0.2).unwrap();

        let ranked = handle.list_child_runs_sorted_by_primary_metric().await.unwrap();
        let order: Vec<usize> = ranked.iter().map(|c| c.submission_index).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_non_finite_reports_are_skipped() {
        let (cp, config) = setup(MetricGoal::Maximize, 2);
        let handle = submit(&cp, &config).await;
        let child = cp.spawn_child(handle.id()).unwrap();
        cp.log_metric(&child, "accuracy", 0.6).unwrap();
        cp.log_metric(&child, "accuracy", f64::NAN).unwrap();

        let best = handle.best_child_run().await.unwrap();
        assert_eq!(best.primary_metric_value, Some(0.6));
    }

    #[tokio::test]
    async fn test_best_child_without_reports() {
        let (cp, config) = setup(MetricGoal::Maximize, 2);
        let handle = submit(&cp, &config).await;

        let err = handle.best_child_run().await.unwrap_err();
        assert!(matches!(err, HdError::NoCompletedRuns { .. }));
        assert!(err.is_retryable());

        let child = cp.spawn_child(handle.id()).unwrap();
        cp.log_metric(&child, "loss", 0.3).unwrap();
        assert!(matches!(
            handle.best_child_run().await,
            Err(HdError::NoCompletedRuns { .. })
        ));
    }

    #[tokio::test]
    async fn test_child_run_metrics_and_attach() {
        let (cp, config) = setup(MetricGoal::Maximize, 2);
        let handle = submit(&cp, &config).await;
        assert!(handle.submitted_at().is_some());

        let a = cp.spawn_child(handle.id()).unwrap();
        let b = cp.spawn_child(handle.id()).unwrap();
        cp.log_metric(&a, "loss", 1.5).unwrap();
        cp.log_metric(&a, "accuracy", 0.4).unwrap();

        let attached = RunHandle::attach(
            handle.experiment().clone(),
            handle.id().clone(),
            handle.primary_metric().clone(),
        );
        assert!(attached.submitted_at().is_none());

        let metrics = attached.child_run_metrics().await.unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[&a]["loss"], vec![1.5]);
        assert!(metrics[&b].is_empty());
    }

    #[tokio::test]
    async fn test_unknown_run_surfaces_not_found() {
        let (cp, config) = setup(MetricGoal::Maximize, 2);
        let handle = submit(&cp, &config).await;
        let stray = RunHandle::attach(
            handle.experiment().clone(),
            RunId::new("HD_missing"),
            handle.primary_metric().clone(),
        );
        assert!(matches!(
            stray.poll_status().await,
            Err(HdError::RunNotFound { .. })
        ));
    }
}
