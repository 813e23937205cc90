//! Wait settings and progress reporting for blocking on a run.

use hd_types::{invalid_argument, HdResult, RunId, RunState};
use std::time::Duration;
use tracing::info;

/// Default interval between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How [`crate::RunHandle::wait_with`] polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl WaitOptions {
    pub fn new(poll_interval: Duration) -> HdResult<Self> {
        if poll_interval.is_zero() {
            return Err(invalid_argument!("poll_interval must be greater than zero"));
        }
        Ok(Self {
            poll_interval,
            timeout: None,
        })
    }

    /// Give up with `WaitTimedOut` after `timeout`. The remote run is untouched.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

/// Receives updates while a caller waits on a run.
pub trait ProgressReporter: Send + Sync {
    /// Called on the first poll and whenever the observed state changes.
    fn on_state_change(&self, run_id: &RunId, state: RunState, elapsed: Duration);

    /// Called after every poll.
    fn on_poll(&self, _run_id: &RunId, _state: RunState) {}
}

/// Discards all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn on_state_change(&self, _run_id: &RunId, _state: RunState, _elapsed: Duration) {}
}

/// Reports state changes as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn on_state_change(&self, run_id: &RunId, state: RunState, elapsed: Duration) {
        info!(%run_id, %state, elapsed_secs = elapsed.as_secs(), "run status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_poll_interval_rejected() {
        assert!(WaitOptions::new(Duration::ZERO).is_err());
        let options = WaitOptions::new(Duration::from_secs(2))
            .unwrap()
            .with_timeout(Duration::from_secs(60));
        assert_eq!(options.poll_interval(), Duration::from_secs(2));
        assert_eq!(options.timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn default_options() {
        let options = WaitOptions::default();
        assert_eq!(options.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert!(options.timeout().is_none());
    }
}
