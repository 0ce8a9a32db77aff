use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{MultipartError, MultipartResult};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Size limits that every multipart upload has to respect.
///
/// The defaults match the AWS S3 quotas. Other S3-compatible backends (Ceph
/// RadosGW, MinIO, Aliyun OSS) may publish different limits; the minimum part
/// size in particular must match the backend or it will reject parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizePolicy {
    /// Smallest part the backend accepts (the sole part of an object is exempt)
    pub min_part_size: u64,

    /// Size the chunker aims for whenever the limits allow it
    pub preferred_part_size: u64,

    /// Largest single part the backend accepts
    pub max_part_size: u64,

    /// Maximum number of parts in one multipart upload
    pub max_part_count: u64,

    /// Maximum size of the assembled object
    pub max_object_size: u64,
}

impl Default for SizePolicy {
    fn default() -> Self {
        Self {
            min_part_size: 5 * MIB,
            preferred_part_size: 50 * MIB,
            max_part_size: 5 * GIB,
            max_part_count: 10_000,
            max_object_size: 5 * TIB,
        }
    }
}

impl SizePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_part_size(mut self, bytes: u64) -> Self {
        self.min_part_size = bytes;
        self
    }

    pub fn with_preferred_part_size(mut self, bytes: u64) -> Self {
        self.preferred_part_size = bytes;
        self
    }

    pub fn with_max_part_size(mut self, bytes: u64) -> Self {
        self.max_part_size = bytes;
        self
    }

    pub fn with_max_part_count(mut self, count: u64) -> Self {
        self.max_part_count = count;
        self
    }

    pub fn with_max_object_size(mut self, bytes: u64) -> Self {
        self.max_object_size = bytes;
        self
    }

    /// Check that the limits are positive and mutually consistent
    pub fn validate(&self) -> MultipartResult<()> {
        let fields = [
            ("min_part_size", self.min_part_size),
            ("preferred_part_size", self.preferred_part_size),
            ("max_part_size", self.max_part_size),
            ("max_part_count", self.max_part_count),
            ("max_object_size", self.max_object_size),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| *value == 0) {
            return Err(MultipartError::invalid_config(format!("{} must be positive", name)));
        }

        if self.min_part_size > self.preferred_part_size {
            return Err(MultipartError::invalid_config(format!(
                "min_part_size {} exceeds preferred_part_size {}",
                self.min_part_size, self.preferred_part_size
            )));
        }
        if self.preferred_part_size > self.max_part_size {
            return Err(MultipartError::invalid_config(format!(
                "preferred_part_size {} exceeds max_part_size {}",
                self.preferred_part_size, self.max_part_size
            )));
        }

        // A tail shorter than min_part_size is folded into its neighbour, which
        // needs room for both inside max_part_size.
        if self.max_part_size < self.min_part_size.saturating_mul(2) {
            return Err(MultipartError::invalid_config(format!(
                "max_part_size {} must be at least twice min_part_size {}",
                self.max_part_size, self.min_part_size
            )));
        }

        let reachable = self.max_part_size.saturating_mul(self.max_part_count);
        if self.max_object_size > reachable {
            return Err(MultipartError::invalid_config(format!(
                "max_object_size {} cannot be reached with {} parts of at most {} bytes",
                self.max_object_size, self.max_part_count, self.max_part_size
            )));
        }

        Ok(())
    }
}

/// Configuration for the multipart upload pipeline
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Part and object size limits
    pub policy: SizePolicy,

    /// Sealed parts that may wait on disk for an upload slot before writes block
    pub max_buffered_parts: usize,

    /// Parts that may be in flight to the backend at once (process-wide)
    pub concurrency: usize,

    /// Directory for spool files. `None` uses the platform's temporary directory
    pub temp_dir: Option<PathBuf>,

    /// Skip MD5/SHA-256 computation for parts. Saves CPU, loses integrity checks
    pub disable_content_hashes: bool,

    /// Extra attempts for a part after a transient backend failure
    pub max_part_retries: u32,

    /// Delay before the first retry, doubled for each further attempt
    pub part_retry_backoff: Duration,

    /// Prepended to the key of every uploaded object, e.g. "path/to/uploads/"
    pub object_prefix: String,

    /// Prepended to the key of `.info` objects. Falls back to `object_prefix`
    pub metadata_object_prefix: Option<String>,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            policy: SizePolicy::default(),
            max_buffered_parts: 20,
            concurrency: 10,
            temp_dir: None,
            disable_content_hashes: false,
            max_part_retries: 3,
            part_retry_backoff: Duration::from_millis(200),
            object_prefix: String::new(),
            metadata_object_prefix: None,
        }
    }
}

impl MultipartConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: SizePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_buffered_parts(mut self, parts: usize) -> Self {
        self.max_buffered_parts = parts;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit;
        self
    }

    pub fn with_temp_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn disable_content_hashes(mut self) -> Self {
        self.disable_content_hashes = true;
        self
    }

    pub fn with_max_part_retries(mut self, retries: u32) -> Self {
        self.max_part_retries = retries;
        self
    }

    pub fn with_part_retry_backoff(mut self, backoff: Duration) -> Self {
        self.part_retry_backoff = backoff;
        self
    }

    pub fn with_object_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.object_prefix = prefix.into();
        self
    }

    pub fn with_metadata_object_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.metadata_object_prefix = Some(prefix.into());
        self
    }

    /// Key of the object assembled for upload `id`
    pub fn object_key(&self, id: &str) -> String {
        format!("{}{}", self.object_prefix, id)
    }

    /// Key of the `.info` sidecar for upload `id`
    pub fn info_key(&self, id: &str) -> String {
        let prefix = self
            .metadata_object_prefix
            .as_deref()
            .unwrap_or(&self.object_prefix);
        format!("{}{}.info", prefix, id)
    }

    pub fn validate(&self) -> MultipartResult<()> {
        self.policy.validate()?;
        if self.max_buffered_parts == 0 {
            return Err(MultipartError::invalid_config("max_buffered_parts must be positive"));
        }
        if self.concurrency == 0 {
            return Err(MultipartError::invalid_config("concurrency must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_s3_quotas() {
        let config = MultipartConfig::default();
        assert_eq!(config.policy.min_part_size, 5 * 1024 * 1024);
        assert_eq!(config.policy.preferred_part_size, 50 * 1024 * 1024);
        assert_eq!(config.policy.max_part_size, 5 * 1024 * 1024 * 1024);
        assert_eq!(config.policy.max_part_count, 10_000);
        assert_eq!(config.policy.max_object_size, 5 * 1024 * 1024 * 1024 * 1024);
        assert_eq!(config.max_buffered_parts, 20);
        assert_eq!(config.concurrency, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_part_sizes() {
        let policy = SizePolicy::default().with_preferred_part_size(1024);
        assert!(matches!(policy.validate(), Err(MultipartError::InvalidConfig { .. })));

        let policy = SizePolicy::default().with_preferred_part_size(6 * GIB);
        assert!(matches!(policy.validate(), Err(MultipartError::InvalidConfig { .. })));
    }

    #[test]
    fn rejects_zero_limits() {
        let policy = SizePolicy::default().with_max_part_count(0);
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("max_part_count"));
    }

    #[test]
    fn rejects_unreachable_object_size() {
        let policy = SizePolicy::default()
            .with_max_part_count(10)
            .with_max_object_size(100 * GIB);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = MultipartConfig::default().with_concurrency(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn info_key_prefers_metadata_prefix() {
        let config = MultipartConfig::default().with_object_prefix("uploads/");
        assert_eq!(config.object_key("abc"), "uploads/abc");
        assert_eq!(config.info_key("abc"), "uploads/abc.info");

        let config = config.with_metadata_object_prefix("meta/");
        assert_eq!(config.info_key("abc"), "meta/abc.info");
    }
}
