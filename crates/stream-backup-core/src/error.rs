use std::fmt;
use thiserror::Error;

pub type Result<T, E = BackupError> = std::result::Result<T, E>;

/// Failure of one stage of a (deployment, provider) run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no snapshots available: {0}")]
    NoSnapshotsAvailable(String),

    #[error("{}", remote_message(.status, .message))]
    Remote { status: Option<u16>, message: String },

    #[error("restore job not ready after {ticks} poll(s)")]
    TimedOut { ticks: u32 },

    #[error("restore job ended with status {status}")]
    JobAborted { status: String },

    #[error("part {part_number} failed after {attempts} attempt(s): {message}")]
    UploadPartFailure {
        part_number: i32,
        attempts: u32,
        message: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("worker task failed: {0}")]
    Task(String),
}

fn remote_message(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("bad status code {code}: {message}"),
        None => format!("transport error: {message}"),
    }
}

impl BackupError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn transport(message: impl fmt::Display) -> Self {
        Self::Remote {
            status: None,
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NoSnapshotsAvailable(_) => ErrorKind::NoSnapshots,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::TimedOut { .. } => ErrorKind::TimedOut,
            Self::JobAborted { .. } => ErrorKind::JobAborted,
            Self::UploadPartFailure { .. } => ErrorKind::UploadPart,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Task(_) => ErrorKind::Task,
        }
    }
}

/// Stable classification written to run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidConfig,
    NotFound,
    NoSnapshots,
    Remote,
    TimedOut,
    JobAborted,
    UploadPart,
    InvalidInput,
    Task,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid_config",
            Self::NotFound => "not_found",
            Self::NoSnapshots => "no_snapshots",
            Self::Remote => "remote",
            Self::TimedOut => "timed_out",
            Self::JobAborted => "job_aborted",
            Self::UploadPart => "upload_part",
            Self::InvalidInput => "invalid_input",
            Self::Task => "task",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_render_status_or_transport() {
        let err = BackupError::status(404, "no such group");
        assert_eq!(err.to_string(), "bad status code 404: no such group");
        let err = BackupError::transport("connection refused");
        assert_eq!(err.to_string(), "transport error: connection refused");
        assert_eq!(err.kind(), ErrorKind::Remote);
    }

    #[test]
    fn kinds_have_report_names() {
        assert_eq!(BackupError::TimedOut { ticks: 3 }.kind().as_str(), "timed_out");
        assert_eq!(
            BackupError::NoSnapshotsAvailable(String::new()).kind().to_string(),
            "no_snapshots"
        );
    }
}
