//! Upload side: streams a finished snapshot download into object storage as
//! a bounded-concurrency multipart upload.

pub mod chunk;
pub mod provider;
pub mod relay;
pub mod s3;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use provider::{Provider, StreamProvider};
pub use relay::{CompletedPart, MultipartSink, StreamingUploader, UploadEvent, UploadOptions};
pub use s3::{AwsProviderConfig, S3Sink};
