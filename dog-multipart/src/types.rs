use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle of a single part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartState {
    /// Bytes are still being written to the spool, or waiting to be re-staged
    Pending,
    /// Sealed on disk, waiting for an upload permit
    Staged,
    /// Backend call in flight
    Uploading,
    Uploaded,
    Failed,
}

/// Lifecycle of a backend multipart upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Completing,
    Completed,
    Aborting,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Bookkeeping for one part of an upload session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRecord {
    /// 0-based; the backend part number is `index + 1`
    pub index: u32,
    pub offset: u64,
    pub size: u64,
    pub state: PartState,
    /// Spool file while the part is on disk
    pub spool_path: Option<PathBuf>,
    pub etag: Option<String>,
    /// Base64 SHA-256 sent with the part, repeated at completion
    pub checksum_sha256: Option<String>,
    /// Upload attempts made so far
    pub attempts: u32,
}

impl PartRecord {
    pub fn new(index: u32, offset: u64, size: u64) -> Self {
        Self {
            index,
            offset,
            size,
            state: PartState::Pending,
            spool_path: None,
            etag: None,
            checksum_sha256: None,
            attempts: 0,
        }
    }

    /// Backend part number (1-based)
    pub fn part_number(&self) -> i32 {
        self.index as i32 + 1
    }

    /// Byte range covered by the part, end exclusive
    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.size
    }
}

/// Integrity digests of a spooled part, base64 encoded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartDigests {
    pub content_md5: Option<String>,
    pub checksum_sha256: Option<String>,
}

/// Part reference sent with the completion call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
    /// Present when the upload was created with SHA-256 checksums
    pub checksum_sha256: Option<String>,
}

/// Result of a successfully finalized upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedUpload {
    pub key: String,
    /// Backend multipart upload id, `None` for uploads stored with a single put
    pub upload_id: Option<String>,
    pub etag: Option<String>,
    pub size_bytes: u64,
    pub parts: u32,
}

/// Per-upload request options
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Total length of the stream, if the client declared it
    pub size: Option<u64>,
    pub content_type: Option<String>,
    /// User metadata, sent as backend headers after sanitization
    pub metadata: BTreeMap<String, String>,
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Byte range for partial reads, end inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// HTTP `Range` header value
    pub fn to_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Snapshot of how many parts are staged and uploading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub staged: usize,
    pub uploading: usize,
    pub peak_staged: usize,
    pub peak_uploading: usize,
}

/// Live counters behind [`PipelineStats`], shared by the producer and its workers
#[derive(Debug, Default)]
pub(crate) struct PipelineGauges {
    staged: AtomicUsize,
    uploading: AtomicUsize,
    peak_staged: AtomicUsize,
    peak_uploading: AtomicUsize,
}

impl PipelineGauges {
    pub(crate) fn enter_staged(&self) {
        let now = self.staged.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_staged.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn leave_staged(&self) {
        self.staged.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn enter_uploading(&self) {
        let now = self.uploading.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_uploading.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn leave_uploading(&self) {
        self.uploading.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            staged: self.staged.load(Ordering::SeqCst),
            uploading: self.uploading.load(Ordering::SeqCst),
            peak_staged: self.peak_staged.load(Ordering::SeqCst),
            peak_uploading: self.peak_uploading.load(Ordering::SeqCst),
        }
    }
}
