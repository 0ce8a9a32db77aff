//! # dog-multipart: Disk-buffered multipart uploads for S3-compatible storage
//!
//! `dog-multipart` takes an incoming byte stream of any size (a resumable
//! upload, a video, a backup) and turns it into a multipart upload on an
//! S3-compatible backend, while keeping memory flat and the number of requests
//! in flight bounded.
//!
//! ## Key Features
//!
//! - **Size-aware chunking**: part sizes follow the backend's limits, growing when a stream would run out of parts
//! - **Disk staging with backpressure**: sealed parts wait in temporary files; writers block once the buffer is full
//! - **Bounded concurrency**: one fair semaphore limits concurrent part uploads across the process
//! - **Retries and clean aborts**: transient failures are retried; fatal ones abort the backend upload and delete every spool file
//! - **Backend agnostic**: the pipeline only knows the [`ObjectBackend`](backend::ObjectBackend) trait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_multipart::prelude::*;
//! use dog_multipart::backend::s3::{S3Backend, S3Config};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> MultipartResult<()> {
//! // 1. Connect to the bucket
//! let backend = S3Backend::new(S3Config::from_env()?).await;
//!
//! // 2. One adapter per process
//! let adapter = MultipartAdapter::new(backend, MultipartConfig::default())?;
//!
//! // 3. Stream bytes in as they arrive
//! let cancel = CancellationToken::new();
//! let options = UploadOptions::new().with_content_type("video/mp4");
//! let mut writer = adapter.begin("lecture-01", options, &cancel)?;
//! writer.write(bytes::Bytes::from_static(b"...")).await?;
//!
//! // 4. Assemble the object
//! let completed = writer.finish().await?;
//! println!("stored {} bytes in {} parts", completed.size_bytes, completed.parts);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! bytes ─▶ Chunker ─▶ DiskStager ─▶ UploadSemaphore ─▶ PartUploader ─▶ ObjectBackend
//!                      (spool +        (fair, shared)      (one task
//!                       bounded buffer)                     per part)
//!                                  SessionManager: create / retry / complete / abort
//! ```

pub mod adapter;
pub mod backend;
pub mod chunker;
mod config;
mod error;
pub mod info;
pub mod observability;
pub mod part_uploader;
pub mod semaphore;
pub mod session;
pub mod stager;
mod types;
pub mod upload;

// Re-export main types for clean API
pub use adapter::MultipartAdapter;
pub use backend::{ByteStream, ObjectBackend};
pub use chunker::{ChunkEvent, Chunker, PartSpec};
pub use config::{MultipartConfig, SizePolicy};
pub use error::{BackendError, BackendErrorKind, MultipartError, MultipartResult};
pub use info::{InfoStore, UploadInfo};
pub use observability::{LiveMetrics, NoopObserver, Operation, UploadObserver};
pub use part_uploader::{PartOutcome, PartUploader};
pub use semaphore::{UploadPermit, UploadSemaphore};
pub use session::{PartDecision, SessionManager};
pub use stager::{DiskStager, SpoolWriter, StagedPart, StagingSlot};
pub use types::{
    ByteRange, CompletedPart, CompletedUpload, PartDigests, PartRecord, PartState, PipelineStats,
    SessionState, UploadOptions,
};
pub use upload::UploadWriter;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CompletedUpload, MultipartAdapter, MultipartConfig, MultipartError, MultipartResult,
        ObjectBackend, SizePolicy, UploadOptions, UploadWriter,
    };
}
