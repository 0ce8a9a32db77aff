use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backend::{
    sanitize_metadata, ByteStream, CompleteMultipartUploadRequest, CreateMultipartUploadRequest,
    GetObjectResponse, ObjectBackend, UploadPartCopyRequest,
};
use crate::chunker::Chunker;
use crate::info::InfoStore;
use crate::observability::{timed, NoopObserver, Operation, UploadObserver};
use crate::semaphore::UploadSemaphore;
use crate::session::SessionManager;
use crate::stager::DiskStager;
use crate::types::PipelineGauges;
use crate::upload::UploadWriter;
use crate::{
    BackendErrorKind, ByteRange, CompletedPart, CompletedUpload, MultipartConfig, MultipartError,
    MultipartResult, UploadOptions,
};

/// Entry point for multipart uploads.
///
/// One adapter is meant to live for the whole process: it owns the upload
/// semaphore that every upload started through it shares, so the concurrency
/// limit holds across uploads, not per upload.
pub struct MultipartAdapter {
    backend: Arc<dyn ObjectBackend>,
    observer: Arc<dyn UploadObserver>,
    config: MultipartConfig,
    semaphore: RwLock<UploadSemaphore>,
}

impl MultipartAdapter {
    /// Create an adapter that reports no metrics
    pub fn new<B: ObjectBackend + 'static>(backend: B, config: MultipartConfig) -> MultipartResult<Self> {
        Self::with_observer(Arc::new(backend), Arc::new(NoopObserver), config)
    }

    /// Create an adapter that reports to `observer`
    pub fn with_observer(
        backend: Arc<dyn ObjectBackend>,
        observer: Arc<dyn UploadObserver>,
        config: MultipartConfig,
    ) -> MultipartResult<Self> {
        config.validate()?;
        let semaphore = UploadSemaphore::new(config.concurrency, observer.clone());
        Ok(Self {
            backend,
            observer,
            config,
            semaphore: RwLock::new(semaphore),
        })
    }

    pub fn config(&self) -> &MultipartConfig {
        &self.config
    }

    pub fn backend(&self) -> Arc<dyn ObjectBackend> {
        self.backend.clone()
    }

    /// Sidecar storage for upload descriptions
    pub fn info(&self) -> InfoStore {
        InfoStore::new(self.backend.clone(), self.observer.clone(), self.config.clone())
    }

    pub fn concurrent_part_uploads(&self) -> usize {
        self.semaphore.read().limit()
    }

    /// Replace the upload semaphore. Uploads already running keep the old
    /// limit; uploads started afterwards use the new one
    pub fn set_concurrent_part_uploads(&self, limit: usize) -> MultipartResult<()> {
        if limit == 0 {
            return Err(MultipartError::invalid_config("concurrency must be positive"));
        }
        *self.semaphore.write() = UploadSemaphore::new(limit, self.observer.clone());
        info!("Concurrent part uploads set to {}", limit);
        Ok(())
    }

    /// Start an upload of object `id`.
    ///
    /// Fails right away if the declared size cannot be stored. Cancelling
    /// `cancel` stops the part uploads, deletes their spool files and aborts
    /// the backend upload without waiting for the writer; the writer then
    /// reports `SessionCanceled` on its next call.
    pub fn begin(&self, id: &str, options: UploadOptions, cancel: &CancellationToken) -> MultipartResult<UploadWriter> {
        let chunker = Chunker::new(self.config.policy.clone(), options.size)?;
        let key = self.config.object_key(id);
        let gauges = Arc::new(PipelineGauges::default());
        let stager = DiskStager::new(&self.config, self.observer.clone(), gauges.clone());
        let cancel = cancel.child_token();

        let session = SessionManager::new(
            self.backend.clone(),
            self.observer.clone(),
            self.semaphore.read().clone(),
            stager.clone(),
            gauges.clone(),
            &self.config,
            key,
            options.content_type.clone(),
            options.metadata.clone(),
            cancel.clone(),
        );
        Ok(UploadWriter::new(
            id.to_string(),
            options,
            chunker,
            stager,
            session,
            self.backend.clone(),
            self.observer.clone(),
            gauges,
            cancel,
        ))
    }

    /// Upload a whole stream as object `id`
    #[instrument(skip(self, options, stream, cancel))]
    pub async fn upload_stream(
        &self,
        id: &str,
        options: UploadOptions,
        mut stream: ByteStream,
        cancel: &CancellationToken,
    ) -> MultipartResult<CompletedUpload> {
        let mut writer = self.begin(id, options, cancel)?;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    writer.abort().await;
                    return Err(MultipartError::SessionCanceled);
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(bytes)) => writer.write(bytes).await?,
                Some(Err(e)) => {
                    writer.abort().await;
                    return Err(MultipartError::invalid(format!("reading upload body: {}", e)));
                }
                None => break,
            }
        }
        writer.finish().await
    }

    /// Read an uploaded object, optionally only a range of it
    pub async fn open(&self, id: &str, range: Option<ByteRange>) -> MultipartResult<GetObjectResponse> {
        let key = self.config.object_key(id);
        timed(
            self.observer.as_ref(),
            Operation::GetObject,
            self.backend.get_object(&key, range),
        )
        .await
        .map_err(|e| match e.kind {
            BackendErrorKind::NotFound => MultipartError::not_found(key.clone()),
            _ => e.into(),
        })
    }

    /// Assemble object `id` from already uploaded objects, in order, without
    /// moving their bytes through this process
    #[instrument(skip(self, options))]
    pub async fn concat(&self, id: &str, sources: &[String], options: UploadOptions) -> MultipartResult<CompletedUpload> {
        if sources.is_empty() {
            return Err(MultipartError::invalid("nothing to concatenate"));
        }
        if sources.len() as u64 > self.config.policy.max_part_count {
            return Err(MultipartError::size_limit(format!(
                "{} sources exceed max_part_count {}",
                sources.len(),
                self.config.policy.max_part_count
            )));
        }

        let key = self.config.object_key(id);
        let request = CreateMultipartUploadRequest {
            key: key.clone(),
            content_type: options.content_type,
            metadata: sanitize_metadata(&options.metadata),
            checksum_sha256: false,
        };
        let upload_id = timed(
            self.observer.as_ref(),
            Operation::CreateMultipartUpload,
            self.backend.create_multipart_upload(request),
        )
        .await?;

        match self.copy_parts(&key, &upload_id, sources).await {
            Ok(completed) => Ok(completed),
            Err(err) => {
                let aborted = timed(
                    self.observer.as_ref(),
                    Operation::AbortMultipartUpload,
                    self.backend.abort_multipart_upload(&key, &upload_id),
                )
                .await;
                if let Err(abort_err) = aborted {
                    warn!("Backend abort of {} for {} failed: {}", upload_id, key, abort_err);
                }
                Err(err)
            }
        }
    }

    async fn copy_parts(&self, key: &str, upload_id: &str, sources: &[String]) -> MultipartResult<CompletedUpload> {
        let policy = &self.config.policy;
        let mut parts = Vec::with_capacity(sources.len());
        let mut size_bytes = 0u64;

        for (position, source) in sources.iter().enumerate() {
            let source_key = self.config.object_key(source);
            let head = timed(
                self.observer.as_ref(),
                Operation::HeadObject,
                self.backend.head_object(&source_key),
            )
            .await?;
            if position + 1 < sources.len() && head.size_bytes < policy.min_part_size {
                return Err(MultipartError::invalid(format!(
                    "{} has {} bytes, below min_part_size {}",
                    source, head.size_bytes, policy.min_part_size
                )));
            }
            if head.size_bytes > policy.max_part_size {
                return Err(MultipartError::size_limit(format!(
                    "{} has {} bytes, above max_part_size {}",
                    source, head.size_bytes, policy.max_part_size
                )));
            }
            size_bytes += head.size_bytes;
            if size_bytes > policy.max_object_size {
                return Err(MultipartError::size_limit(format!(
                    "concatenation exceeds max_object_size {}",
                    policy.max_object_size
                )));
            }

            let part_number = position as i32 + 1;
            let request = UploadPartCopyRequest {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                part_number,
                source_key,
                source_range: None,
            };
            let etag = timed(
                self.observer.as_ref(),
                Operation::UploadPartCopy,
                self.backend.upload_part_copy(request),
            )
            .await?;
            parts.push(CompletedPart {
                part_number,
                etag,
                checksum_sha256: None,
            });
        }

        let count = parts.len() as u32;
        let request = CompleteMultipartUploadRequest {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            parts,
        };
        let response = timed(
            self.observer.as_ref(),
            Operation::CompleteMultipartUpload,
            self.backend.complete_multipart_upload(request),
        )
        .await?;
        info!("Concatenated {} sources into {}", count, key);

        Ok(CompletedUpload {
            key: key.to_string(),
            upload_id: Some(upload_id.to_string()),
            etag: response.etag,
            size_bytes,
            parts: count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::observability::LiveMetrics;
    use crate::SizePolicy;
    use bytes::Bytes;
    use futures::TryStreamExt;

    fn tiny_policy() -> SizePolicy {
        SizePolicy::new()
            .with_min_part_size(4)
            .with_preferred_part_size(8)
            .with_max_part_size(64)
            .with_max_part_count(100)
            .with_max_object_size(1600)
    }

    #[test]
    fn rejects_invalid_config() {
        let config = MultipartConfig::default().with_max_buffered_parts(0);
        assert!(MultipartAdapter::new(MemoryBackend::new(), config).is_err());
    }

    #[test]
    fn concurrency_can_be_changed() {
        let metrics = Arc::new(LiveMetrics::new());
        let adapter = MultipartAdapter::with_observer(
            Arc::new(MemoryBackend::new()),
            metrics.clone(),
            MultipartConfig::default(),
        )
        .unwrap();
        assert_eq!(adapter.concurrent_part_uploads(), 10);
        assert_eq!(metrics.semaphore_limit(), 10);

        adapter.set_concurrent_part_uploads(3).unwrap();
        assert_eq!(adapter.concurrent_part_uploads(), 3);
        assert_eq!(metrics.semaphore_limit(), 3);
        assert!(adapter.set_concurrent_part_uploads(0).is_err());
    }

    #[tokio::test]
    async fn open_reads_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let config = MultipartConfig::default()
            .with_policy(tiny_policy())
            .with_temp_dir(dir.path())
            .with_object_prefix("files/");
        let adapter = MultipartAdapter::new(backend.clone(), config).unwrap();

        let body: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"abcdef")),
        ]));
        let completed = adapter
            .upload_stream("doc", UploadOptions::new(), body, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completed.key, "files/doc");
        assert_eq!(completed.size_bytes, 16);

        let got = adapter.open("doc", Some(ByteRange::new(8, Some(11)))).await.unwrap();
        let chunks: Vec<Bytes> = got.stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"89ab");

        assert!(matches!(adapter.open("missing", None).await, Err(MultipartError::NotFound { .. })));
    }

    #[tokio::test]
    async fn concat_copies_sources_in_order() {
        let backend = MemoryBackend::new().with_min_part_size(4);
        let adapter = MultipartAdapter::new(
            backend.clone(),
            MultipartConfig::default().with_policy(tiny_policy()),
        )
        .unwrap();
        for (id, data) in [("a", "first-"), ("b", "second")] {
            backend
                .put_object(crate::backend::PutObjectRequest::new(
                    id,
                    crate::backend::ObjectBody::Bytes(Bytes::from(data)),
                ))
                .await
                .unwrap();
        }

        let completed = adapter
            .concat("joined", &["a".to_string(), "b".to_string()], UploadOptions::new())
            .await
            .unwrap();
        assert_eq!(completed.parts, 2);
        assert_eq!(backend.object("joined").unwrap(), &b"first-second"[..]);
    }

    #[tokio::test]
    async fn concat_aborts_on_missing_source() {
        let backend = MemoryBackend::new();
        let adapter = MultipartAdapter::new(backend.clone(), MultipartConfig::default()).unwrap();

        let err = adapter
            .concat("joined", &["ghost".to_string()], UploadOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MultipartError::NotFound { .. }));
        assert_eq!(backend.abort_calls(), 1);
        assert_eq!(backend.pending_uploads(), 0);
    }
}
