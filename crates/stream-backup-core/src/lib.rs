pub mod config;
pub mod error;
pub mod model;
pub mod plan;
pub mod report;
pub mod select;

pub use error::{BackupError, ErrorKind, Result};
