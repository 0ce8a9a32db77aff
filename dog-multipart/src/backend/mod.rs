use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::{BackendError, ByteRange, CompletedPart, PartDigests};

pub mod memory;
pub mod s3;

/// Result type for backend calls
pub type BackendResult<T> = Result<T, BackendError>;

/// Stream of bytes for object content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Object-storage operations the upload pipeline is written against.
///
/// Any S3-API-compatible service can sit behind this trait. The pipeline only
/// ever holds an `Arc<dyn ObjectBackend>`, never a concrete client.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Store a whole object in one request
    async fn put_object(&self, request: PutObjectRequest) -> BackendResult<PutObjectResponse>;

    /// Read an object, optionally a byte range of it
    async fn get_object(&self, key: &str, range: Option<ByteRange>) -> BackendResult<GetObjectResponse>;

    /// Object metadata without content
    async fn head_object(&self, key: &str) -> BackendResult<ObjectHead>;

    async fn delete_object(&self, key: &str) -> BackendResult<()>;

    /// Delete several objects in one request. Missing keys are not an error
    async fn delete_objects(&self, keys: &[String]) -> BackendResult<()>;

    /// Start a multipart upload and return its backend upload id
    async fn create_multipart_upload(&self, request: CreateMultipartUploadRequest) -> BackendResult<String>;

    /// Upload one part and return the ETag the backend assigned to it
    async fn upload_part(&self, request: UploadPartRequest) -> BackendResult<String>;

    /// Use (a range of) an existing object as a part and return its ETag
    async fn upload_part_copy(&self, request: UploadPartCopyRequest) -> BackendResult<String>;

    /// Assemble the uploaded parts into the final object
    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartUploadRequest,
    ) -> BackendResult<CompleteMultipartUploadResponse>;

    /// Discard a multipart upload and every part uploaded for it
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()>;
}

/// Request payload: in memory, or a file read sequentially by the backend
#[derive(Debug, Clone)]
pub enum ObjectBody {
    Bytes(Bytes),
    File { path: PathBuf, length: u64 },
}

impl ObjectBody {
    pub fn empty() -> Self {
        Self::Bytes(Bytes::new())
    }

    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::File { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the whole body into memory
    pub async fn read_all(&self) -> std::io::Result<Bytes> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::File { path, .. } => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutObjectRequest {
    pub key: String,
    pub body: ObjectBody,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl PutObjectRequest {
    pub fn new<S: Into<String>>(key: S, body: ObjectBody) -> Self {
        Self {
            key: key.into(),
            body,
            content_type: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = sanitize_metadata(&metadata);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutObjectResponse {
    pub etag: Option<String>,
}

/// Result of a get operation
pub struct GetObjectResponse {
    pub stream: ByteStream,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
}

/// Metadata about a stored object
#[derive(Debug, Clone, Default)]
pub struct ObjectHead {
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateMultipartUploadRequest {
    pub key: String,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Parts will carry SHA-256 checksums
    pub checksum_sha256: bool,
}

#[derive(Debug, Clone)]
pub struct UploadPartRequest {
    pub key: String,
    pub upload_id: String,
    /// 1-based
    pub part_number: i32,
    pub body: ObjectBody,
    /// Empty when content hashes are disabled; no digest fields are sent then
    pub digests: PartDigests,
}

#[derive(Debug, Clone)]
pub struct UploadPartCopyRequest {
    pub key: String,
    pub upload_id: String,
    pub part_number: i32,
    /// Source object key, in the same bucket
    pub source_key: String,
    pub source_range: Option<ByteRange>,
}

#[derive(Debug, Clone)]
pub struct CompleteMultipartUploadRequest {
    pub key: String,
    pub upload_id: String,
    /// Must be sorted by part number
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Clone, Default)]
pub struct CompleteMultipartUploadResponse {
    pub etag: Option<String>,
}

/// Strip every character that is not valid inside an HTTP header value
/// (anything outside tab and printable ASCII 0x20-0x7E).
pub fn sanitize_header_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c == '\t' || (' '..='~').contains(c))
        .collect()
}

/// Sanitize both names and values of user metadata headed for request headers
pub fn sanitize_metadata(metadata: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    metadata
        .iter()
        .map(|(key, value)| (sanitize_header_value(key), sanitize_header_value(value)))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_non_printable_ascii() {
        assert_eq!(sanitize_header_value("report.pdf"), "report.pdf");
        assert_eq!(sanitize_header_value("tab\there"), "tab\there");
        assert_eq!(sanitize_header_value("line\nbreak\r"), "linebreak");
        assert_eq!(sanitize_header_value("café ünïcode"), "caf ncode");
        assert_eq!(sanitize_header_value("\u{7f}del"), "del");
    }

    #[test]
    fn sanitize_metadata_drops_empty_names() {
        let mut metadata = BTreeMap::new();
        metadata.insert("filename".to_string(), "résumé.doc".to_string());
        metadata.insert("ü".to_string(), "x".to_string());

        let clean = sanitize_metadata(&metadata);
        assert_eq!(clean.len(), 1);
        assert_eq!(clean["filename"], "rsum.doc");
    }

    #[tokio::test]
    async fn body_reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part");
        tokio::fs::write(&path, b"spooled").await.unwrap();

        let body = ObjectBody::File { path, length: 7 };
        assert_eq!(body.len(), 7);
        assert_eq!(&body.read_all().await.unwrap()[..], b"spooled");
    }
}
