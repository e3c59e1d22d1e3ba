//! Client side of the cloud backup-management service: the API seam, the
//! restore-job readiness poller and the per-deployment orchestrator.

pub mod api;
pub mod auth;
pub mod pipeline;
pub mod poll;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{BackupApi, CloudManagerClient};
pub use pipeline::{Orchestrator, PipelineContext};
pub use poll::{PollOptions, PollState, ReadinessPoller};
