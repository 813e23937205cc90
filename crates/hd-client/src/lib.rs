//! # hd-client
//!
//! Talks to the platform's control plane on behalf of a sweep: submission
//! through an [`Experiment`], status polling and waiting through a
//! [`RunHandle`], and child-run metric queries.
//!
//! Two control planes ship with the crate. [`RestControlPlane`] speaks HTTP to
//! a real service; [`InMemoryControlPlane`] simulates one in process.

pub mod control_plane;
pub mod experiment;
pub mod memory;
pub mod progress;
pub mod rest;
pub mod run;

pub use control_plane::ControlPlane;
pub use experiment::Experiment;
pub use memory::{InMemoryControlPlane, InMemoryControlPlaneConfig};
pub use progress::{LogProgress, NoProgress, ProgressReporter, WaitOptions, DEFAULT_POLL_INTERVAL};
pub use rest::{RestConfig, RestControlPlane};
pub use run::{ChildRunSummary, RunHandle};
