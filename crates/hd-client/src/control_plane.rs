//! The narrow contract hyperdrive needs from the platform's control plane.

use async_trait::async_trait;
use hd_types::{HdResult, RunId, RunMetrics, RunState};

/// Core control-plane interface.
///
/// Implementations may talk to the platform's REST API (see
/// [`super::rest::RestControlPlane`]) or keep everything in process (see
/// [`super::memory::InMemoryControlPlane`]). Nothing above this trait knows
/// about HTTP verbs, headers, or authentication.
///
/// Errors follow the hyperdrive taxonomy: a service-side validation failure on
/// submit is `SubmissionRejected`, connectivity problems are `Transport`, and
/// an unknown id is `RunNotFound`.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Submit a serialized job description. Returns the service-assigned id.
    ///
    /// Every call creates a new remote run; there is no deduplication.
    async fn submit_job(&self, job: &serde_json::Value) -> HdResult<RunId>;

    /// Current remote state of a run.
    async fn get_job_status(&self, job_id: &RunId) -> HdResult<RunState>;

    /// Every metric value the run has logged so far.
    async fn get_job_metrics(&self, job_id: &RunId) -> HdResult<RunMetrics>;

    /// Child runs of a sweep, in submission order.
    async fn list_child_jobs(&self, job_id: &RunId) -> HdResult<Vec<RunId>>;
}
