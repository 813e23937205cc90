//! Early-termination policies.
//!
//! The service evaluates the policy for every child run each time it reports
//! the primary metric. Report number `n` (1-based) is a checkpoint when
//! `n > delay_evaluation` and `(n - delay_evaluation) % evaluation_interval == 0`.
//! At a checkpoint, with `v` the run's value at report `n`:
//!
//! * **Bandit** terminates the run if `v` is not within the slack of the best
//!   value any run reported at `n`. A `slack_factor` is relative: when
//!   maximizing the bound is `best - |best| * slack_factor / (1 + slack_factor)`
//!   (`best / (1 + slack_factor)` for positive values), when minimizing it is
//!   `best + |best| * slack_factor`. A `slack_amount` is absolute:
//!   `best - amount` or `best + amount`.
//! * **MedianStopping** terminates the run if `v` is worse than the median of
//!   the running averages (reports `1..=n`) of all runs that reached `n`.
//! * **TruncationSelection** terminates the run if `v` is among the worst
//!   `truncation_percentage`% of the values reported at `n`. Ties at the cutoff
//!   are all terminated.
//!
//! [`TerminationPolicy::should_terminate`] evaluates these rules locally.

use hd_types::{invalid_argument, HdError, HdResult, MetricGoal};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const DEFAULT_EVALUATION_INTERVAL: u32 = 1;
const DEFAULT_DELAY_EVALUATION: u32 = 0;

/// Which policy to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    #[serde(rename = "DEFAULT")]
    None,
    #[serde(rename = "BANDIT")]
    Bandit,
    #[serde(rename = "MEDIAN_STOPPING")]
    MedianStopping,
    #[serde(rename = "TRUNCATION_SELECTION")]
    TruncationSelection,
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyKind::None => "DEFAULT",
            PolicyKind::Bandit => "BANDIT",
            PolicyKind::MedianStopping => "MEDIAN_STOPPING",
            PolicyKind::TruncationSelection => "TRUNCATION_SELECTION",
        }
    }
}

/// Loose parameters for [`TerminationPolicy::build`]. Unset fields take the
/// platform defaults; fields a kind does not use must stay unset.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PolicyParams {
    pub slack_factor: Option<f64>,
    pub slack_amount: Option<f64>,
    pub truncation_percentage: Option<u32>,
    pub exclude_finished_runs: Option<bool>,
    pub evaluation_interval: Option<u32>,
    pub delay_evaluation: Option<u32>,
}

impl PolicyParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slack_factor(mut self, factor: f64) -> Self {
        self.slack_factor = Some(factor);
        self
    }

    pub fn slack_amount(mut self, amount: f64) -> Self {
        self.slack_amount = Some(amount);
        self
    }

    pub fn truncation_percentage(mut self, percentage: u32) -> Self {
        self.truncation_percentage = Some(percentage);
        self
    }

    pub fn exclude_finished_runs(mut self, exclude: bool) -> Self {
        self.exclude_finished_runs = Some(exclude);
        self
    }

    pub fn evaluation_interval(mut self, interval: u32) -> Self {
        self.evaluation_interval = Some(interval);
        self
    }

    pub fn delay_evaluation(mut self, delay: u32) -> Self {
        self.delay_evaluation = Some(delay);
        self
    }
}

/// Bandit tolerance around the best reported value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slack {
    Factor(f64),
    Amount(f64),
}

/// When the policy is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    evaluation_interval: u32,
    delay_evaluation: u32,
}

impl Cadence {
    pub fn new(evaluation_interval: u32, delay_evaluation: u32) -> HdResult<Self> {
        if evaluation_interval == 0 {
            return Err(invalid_argument!("evaluation_interval must be at least 1"));
        }
        Ok(Self {
            evaluation_interval,
            delay_evaluation,
        })
    }

    pub fn evaluation_interval(&self) -> u32 {
        self.evaluation_interval
    }

    pub fn delay_evaluation(&self) -> u32 {
        self.delay_evaluation
    }

    /// Whether report number `report` (1-based) is a checkpoint.
    pub fn is_checkpoint(&self, report: usize) -> bool {
        let delay = self.delay_evaluation as usize;
        report > delay && (report - delay) % self.evaluation_interval as usize == 0
    }
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            evaluation_interval: DEFAULT_EVALUATION_INTERVAL,
            delay_evaluation: DEFAULT_DELAY_EVALUATION,
        }
    }
}

/// Primary-metric history of one run, as seen at evaluation time.
#[derive(Debug, Clone, Copy)]
pub struct RunProgress<'a> {
    pub values: &'a [f64],
    pub finished: bool,
}

/// A validated early-termination policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "PolicyDescriptor", into = "PolicyDescriptor")]
pub enum TerminationPolicy {
    #[default]
    None,
    Bandit {
        slack: Slack,
        cadence: Cadence,
    },
    MedianStopping {
        cadence: Cadence,
    },
    TruncationSelection {
        truncation_percentage: u32,
        exclude_finished_runs: bool,
        cadence: Cadence,
    },
}

impl TerminationPolicy {
    /// Build a policy of `kind`, validating `params` against it.
    pub fn build(kind: PolicyKind, params: &PolicyParams) -> HdResult<Self> {
        let name = kind.as_str();
        let slack_given = params.slack_factor.is_some() || params.slack_amount.is_some();
        let truncation_given =
            params.truncation_percentage.is_some() || params.exclude_finished_runs.is_some();

        let cadence = || {
            Cadence::new(
                params.evaluation_interval.unwrap_or(DEFAULT_EVALUATION_INTERVAL),
                params.delay_evaluation.unwrap_or(DEFAULT_DELAY_EVALUATION),
            )
        };

        let policy = match kind {
            PolicyKind::None => {
                if slack_given
                    || truncation_given
                    || params.evaluation_interval.is_some()
                    || params.delay_evaluation.is_some()
                {
                    return Err(invalid_argument!("{name} policy takes no parameters"));
                }
                TerminationPolicy::None
            }
            PolicyKind::Bandit => {
                if truncation_given {
                    return Err(invalid_argument!("{name} policy does not use truncation settings"));
                }
                let slack = match (params.slack_factor, params.slack_amount) {
                    (Some(factor), None) => Slack::Factor(factor),
                    (None, Some(amount)) => Slack::Amount(amount),
                    (Some(_), Some(_)) => {
                        return Err(invalid_argument!(
                            "{name} policy takes slack_factor or slack_amount, not both"
                        ))
                    }
                    (None, None) => {
                        return Err(invalid_argument!(
                            "{name} policy needs slack_factor or slack_amount"
                        ))
                    }
                };
                TerminationPolicy::Bandit {
                    slack,
                    cadence: cadence()?,
                }
            }
            PolicyKind::MedianStopping => {
                if slack_given || truncation_given {
                    return Err(invalid_argument!(
                        "{name} policy only takes evaluation_interval and delay_evaluation"
                    ));
                }
                TerminationPolicy::MedianStopping { cadence: cadence()? }
            }
            PolicyKind::TruncationSelection => {
                if slack_given {
                    return Err(invalid_argument!("{name} policy does not use slack"));
                }
                let truncation_percentage = params
                    .truncation_percentage
                    .ok_or_else(|| invalid_argument!("{name} policy needs truncation_percentage"))?;
                TerminationPolicy::TruncationSelection {
                    truncation_percentage,
                    exclude_finished_runs: params.exclude_finished_runs.unwrap_or(false),
                    cadence: cadence()?,
                }
            }
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn bandit(params: &PolicyParams) -> HdResult<Self> {
        Self::build(PolicyKind::Bandit, params)
    }

    pub fn median_stopping(params: &PolicyParams) -> HdResult<Self> {
        Self::build(PolicyKind::MedianStopping, params)
    }

    pub fn truncation_selection(params: &PolicyParams) -> HdResult<Self> {
        Self::build(PolicyKind::TruncationSelection, params)
    }

    /// Re-check the numeric ranges. Variants built by hand go through here
    /// before they are accepted into a run configuration.
    pub fn validate(&self) -> HdResult<()> {
        if let Some(cadence) = self.cadence() {
            Cadence::new(cadence.evaluation_interval, cadence.delay_evaluation)?;
        }
        match self {
            TerminationPolicy::Bandit { slack, .. } => {
                let (name, value) = match slack {
                    Slack::Factor(v) => ("slack_factor", *v),
                    Slack::Amount(v) => ("slack_amount", *v),
                };
                if !value.is_finite() || value <= 0.0 {
                    return Err(invalid_argument!("{name} must be a positive number, got {value}"));
                }
            }
            TerminationPolicy::TruncationSelection {
                truncation_percentage,
                ..
            } => {
                if *truncation_percentage == 0 || *truncation_percentage >= 100 {
                    return Err(invalid_argument!(
                        "truncation_percentage must be between 1 and 99, got {truncation_percentage}"
                    ));
                }
            }
            TerminationPolicy::None | TerminationPolicy::MedianStopping { .. } => {}
        }
        Ok(())
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            TerminationPolicy::None => PolicyKind::None,
            TerminationPolicy::Bandit { .. } => PolicyKind::Bandit,
            TerminationPolicy::MedianStopping { .. } => PolicyKind::MedianStopping,
            TerminationPolicy::TruncationSelection { .. } => PolicyKind::TruncationSelection,
        }
    }

    pub fn cadence(&self) -> Option<Cadence> {
        match self {
            TerminationPolicy::None => None,
            TerminationPolicy::Bandit { cadence, .. }
            | TerminationPolicy::MedianStopping { cadence }
            | TerminationPolicy::TruncationSelection { cadence, .. } => Some(*cadence),
        }
    }

    /// Decide whether `candidate` would be terminated at its latest report.
    ///
    /// `candidate` holds the run's primary-metric history; `peers` holds every
    /// other run of the same sweep.
    pub fn should_terminate(
        &self,
        goal: MetricGoal,
        candidate: &[f64],
        peers: &[RunProgress<'_>],
    ) -> bool {
        let Some(cadence) = self.cadence() else {
            return false;
        };
        let report = candidate.len();
        if !cadence.is_checkpoint(report) {
            return false;
        }
        let index = report - 1;
        let value = candidate[index];
        let reached = || peers.iter().filter(move |p| p.values.len() > index);

        match self {
            TerminationPolicy::None => false,
            TerminationPolicy::Bandit { slack, .. } => {
                let best = reached()
                    .map(|p| p.values[index])
                    .fold(value, |best, v| if goal.is_better(v, best) { v } else { best });
                // Relative slack scales with |best|; the bound trails best for any sign.
                let bound = match (goal, slack) {
                    (MetricGoal::Maximize, Slack::Factor(f)) => best - best.abs() * f / (1.0 + f),
                    (MetricGoal::Minimize, Slack::Factor(f)) => best + best.abs() * f,
                    (MetricGoal::Maximize, Slack::Amount(a)) => best - a,
                    (MetricGoal::Minimize, Slack::Amount(a)) => best + a,
                };
                goal.is_better(bound, value)
            }
            TerminationPolicy::MedianStopping { .. } => {
                let mut averages: Vec<f64> = reached().map(|p| mean(&p.values[..report])).collect();
                if averages.is_empty() {
                    return false;
                }
                averages.push(mean(candidate));
                let median = compute_median(&mut averages);
                goal.is_better(median, value)
            }
            TerminationPolicy::TruncationSelection {
                truncation_percentage,
                exclude_finished_runs,
                ..
            } => {
                let mut population: Vec<f64> = reached()
                    .filter(|p| !(*exclude_finished_runs && p.finished))
                    .map(|p| p.values[index])
                    .collect();
                population.push(value);
                let cut = population.len() * *truncation_percentage as usize / 100;
                let worse = population.iter().filter(|v| goal.is_better(value, **v)).count();
                worse < cut
            }
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Median of a non-empty slice. Sorts the slice in place.
fn compute_median(values: &mut [f64]) -> f64 {
    values.sort_unstable_by(f64::total_cmp);
    let len = values.len();
    if len % 2 == 1 {
        values[len / 2]
    } else {
        (values[len / 2 - 1] + values[len / 2]) / 2.0
    }
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// `{"name": ..., "properties": {...}, "evaluation_interval": n, "delay_evaluation": n}`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicyDescriptor {
    name: PolicyKind,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default = "default_evaluation_interval")]
    evaluation_interval: u32,
    #[serde(default)]
    delay_evaluation: u32,
}

fn default_evaluation_interval() -> u32 {
    DEFAULT_EVALUATION_INTERVAL
}

impl From<TerminationPolicy> for PolicyDescriptor {
    fn from(policy: TerminationPolicy) -> Self {
        let cadence = policy.cadence().unwrap_or_default();
        let mut properties = Map::new();
        match &policy {
            TerminationPolicy::Bandit { slack, .. } => {
                let (key, value) = match slack {
                    Slack::Factor(v) => ("slack_factor", *v),
                    Slack::Amount(v) => ("slack_amount", *v),
                };
                properties.insert(key.to_string(), Value::from(value));
            }
            TerminationPolicy::TruncationSelection {
                truncation_percentage,
                exclude_finished_runs,
                ..
            } => {
                properties.insert(
                    "truncation_percentage".to_string(),
                    Value::from(*truncation_percentage),
                );
                properties.insert(
                    "exclude_finished_jobs".to_string(),
                    Value::from(*exclude_finished_runs),
                );
            }
            TerminationPolicy::None | TerminationPolicy::MedianStopping { .. } => {}
        }
        Self {
            name: policy.kind(),
            properties,
            evaluation_interval: cadence.evaluation_interval,
            delay_evaluation: cadence.delay_evaluation,
        }
    }
}

impl TryFrom<PolicyDescriptor> for TerminationPolicy {
    type Error = HdError;

    fn try_from(descriptor: PolicyDescriptor) -> HdResult<Self> {
        if descriptor.name == PolicyKind::None {
            if !descriptor.properties.is_empty() {
                return Err(invalid_argument!("DEFAULT policy takes no properties"));
            }
            return Ok(TerminationPolicy::None);
        }

        let mut params = PolicyParams::new()
            .evaluation_interval(descriptor.evaluation_interval)
            .delay_evaluation(descriptor.delay_evaluation);
        for (key, value) in &descriptor.properties {
            match key.as_str() {
                "slack_factor" => params.slack_factor = Some(number(key, value)?),
                "slack_amount" => params.slack_amount = Some(number(key, value)?),
                "truncation_percentage" => {
                    let pct = value
                        .as_u64()
                        .and_then(|p| u32::try_from(p).ok())
                        .ok_or_else(|| invalid_argument!("truncation_percentage must be an integer"))?;
                    params.truncation_percentage = Some(pct);
                }
                "exclude_finished_jobs" => {
                    let exclude = value
                        .as_bool()
                        .ok_or_else(|| invalid_argument!("exclude_finished_jobs must be a boolean"))?;
                    params.exclude_finished_runs = Some(exclude);
                }
                other => return Err(invalid_argument!("unknown policy property '{other}'")),
            }
        }
        TerminationPolicy::build(descriptor.name, &params)
    }
}

fn number(key: &str, value: &Value) -> HdResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| invalid_argument!("{key} must be a number, got {value}"))
}
