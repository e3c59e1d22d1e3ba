use crate::api::BackupApi;
use std::time::Duration;
use stream_backup_core::config::ApiSettings;
use stream_backup_core::model::JobStatus;
use stream_backup_core::{BackupError, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub max_ticks: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_ticks: 300,
        }
    }
}

impl From<&ApiSettings> for PollOptions {
    fn from(settings: &ApiSettings) -> Self {
        Self {
            interval: settings.poll_interval(),
            max_ticks: settings.poll_max_ticks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Polling { ticks: u32 },
    Ready { ticks: u32 },
    TimedOut { ticks: u32 },
    Failed(BackupError),
}

/// Waits for a restore job to report `FINISHED`.
///
/// Readiness is checked before the tick ceiling, so a job that finishes on
/// the last allowed tick is reported ready. Once a terminal state has been
/// reached every later observation is discarded.
#[derive(Debug)]
pub struct ReadinessPoller {
    options: PollOptions,
    state: PollState,
}

impl ReadinessPoller {
    pub fn new(options: PollOptions) -> Self {
        Self {
            options,
            state: PollState::Polling { ticks: 0 },
        }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, PollState::Polling { .. })
    }

    /// Feeds the result of one status query. Returns the outcome only on the
    /// transition into a terminal state.
    pub fn observe(&mut self, observation: Result<JobStatus>) -> Option<Result<u32>> {
        let PollState::Polling { ticks } = self.state else {
            return None;
        };
        let status = match observation {
            Ok(status) => status,
            Err(err) => {
                self.state = PollState::Failed(err.clone());
                return Some(Err(err));
            }
        };

        let ticks = ticks + 1;
        if status.is_ready() {
            self.state = PollState::Ready { ticks };
            return Some(Ok(ticks));
        }
        if status.is_aborted() {
            let err = BackupError::JobAborted {
                status: status.name().to_string(),
            };
            self.state = PollState::Failed(err.clone());
            return Some(Err(err));
        }
        if ticks >= self.options.max_ticks {
            self.state = PollState::TimedOut { ticks };
            return Some(Err(BackupError::TimedOut { ticks }));
        }
        self.state = PollState::Polling { ticks };
        None
    }

    /// Polls `status_url` every interval until the job is ready, fails, or the
    /// tick ceiling is reached. Returns the number of ticks taken.
    pub async fn run<A>(&mut self, api: &A, status_url: &str) -> Result<u32>
    where
        A: BackupApi + ?Sized,
    {
        loop {
            tokio::time::sleep(self.options.interval).await;
            let observation = api.job_status(status_url).await;
            if let Ok(status) = &observation {
                debug!(status = status.name(), state = ?self.state, "restore job poll");
            }
            if let Some(outcome) = self.observe(observation) {
                return outcome;
            }
        }
    }
}
