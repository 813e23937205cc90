//! Run identity, lifecycle state, and primary-metric vocabulary.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::{HdError, HdResult};

/// Opaque identifier the control plane assigns to a submitted run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RunId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Remote lifecycle state of a run (parent sweep or child run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Queued,
    Running,
    Finalizing,
    CancelRequested,
    Completed,
    Failed,
    Canceled,
}

impl RunState {
    /// `Completed`, `Failed` and `Canceled` are final; no further transitions happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Canceled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Queued => "Queued",
            RunState::Running => "Running",
            RunState::Finalizing => "Finalizing",
            RunState::CancelRequested => "CancelRequested",
            RunState::Completed => "Completed",
            RunState::Failed => "Failed",
            RunState::Canceled => "Canceled",
        };
        f.write_str(name)
    }
}

/// Whether the primary metric is maximized or minimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricGoal {
    Maximize,
    Minimize,
}

impl MetricGoal {
    /// Orders two metric values so that the better one sorts first.
    pub fn compare(self, a: f64, b: f64) -> Ordering {
        match self {
            MetricGoal::Maximize => b.total_cmp(&a),
            MetricGoal::Minimize => a.total_cmp(&b),
        }
    }

    /// True if `candidate` is strictly better than `reference`.
    pub fn is_better(self, candidate: f64, reference: f64) -> bool {
        self.compare(candidate, reference) == Ordering::Less
    }
}

impl FromStr for MetricGoal {
    type Err = HdError;

    fn from_str(s: &str) -> HdResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "maximize" | "max" => Ok(MetricGoal::Maximize),
            "minimize" | "min" => Ok(MetricGoal::Minimize),
            other => Err(HdError::InvalidArgument(format!(
                "unknown metric goal '{other}', expected maximize or minimize"
            ))),
        }
    }
}

/// The metric used to rank child runs and drive early termination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryMetric {
    pub name: String,
    pub goal: MetricGoal,
}

impl PrimaryMetric {
    pub fn new(name: impl Into<String>, goal: MetricGoal) -> HdResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(HdError::InvalidArgument(
                "primary metric name must not be empty".to_string(),
            ));
        }
        Ok(Self { name, goal })
    }
}

/// Every value a run logged, per metric name, in logging order.
pub type RunMetrics = HashMap<String, Vec<f64>>;
