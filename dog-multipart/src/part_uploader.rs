use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::backend::{ObjectBackend, UploadPartRequest};
use crate::observability::{timed, Operation, UploadObserver};
use crate::semaphore::UploadSemaphore;
use crate::stager::{DiskStager, StagedPart};
use crate::types::PipelineGauges;
use crate::BackendError;

/// Result of one upload attempt, reported back to the session
#[derive(Debug)]
pub enum PartOutcome {
    Uploaded {
        index: u32,
        etag: String,
        checksum_sha256: Option<String>,
    },
    /// The part stays on disk so it can be retried
    Failed {
        part: StagedPart,
        attempt: u32,
        error: BackendError,
    },
    /// Session was canceled before the upload finished. The spool file is gone
    Abandoned { index: u32 },
    /// The spool file could not be read back before sending it
    SpoolLost { index: u32, error: io::Error },
}

impl PartOutcome {
    pub fn index(&self) -> u32 {
        match self {
            Self::Uploaded { index, .. } | Self::Abandoned { index } | Self::SpoolLost { index, .. } => *index,
            Self::Failed { part, .. } => part.index,
        }
    }
}

/// Moves staged parts to the backend, one task per part.
#[derive(Clone)]
pub struct PartUploader {
    backend: Arc<dyn ObjectBackend>,
    observer: Arc<dyn UploadObserver>,
    semaphore: UploadSemaphore,
    gauges: Arc<PipelineGauges>,
    key: String,
    upload_id: String,
}

impl PartUploader {
    pub(crate) fn new(
        backend: Arc<dyn ObjectBackend>,
        observer: Arc<dyn UploadObserver>,
        semaphore: UploadSemaphore,
        gauges: Arc<PipelineGauges>,
        key: String,
        upload_id: String,
    ) -> Self {
        Self {
            backend,
            observer,
            semaphore,
            gauges,
            key,
            upload_id,
        }
    }

    /// Wait for a permit, then send the part. The staging slot is given back
    /// as soon as the permit is granted
    #[instrument(skip(self, part, cancel), fields(key = %self.key, index = part.index))]
    pub async fn upload(self, mut part: StagedPart, attempt: u32, cancel: CancellationToken) -> PartOutcome {
        let index = part.index;
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PartOutcome::Abandoned { index },
            permit = self.semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return PartOutcome::Abandoned { index },
            },
        };
        part.release_slot();
        if let Err(error) = check_spool(&part).await {
            return PartOutcome::SpoolLost { index, error };
        }
        let _uploading = Uploading::enter(&self.gauges);

        // Digest fields are only present when hashing produced them.
        let request = UploadPartRequest {
            key: self.key.clone(),
            upload_id: self.upload_id.clone(),
            part_number: part.part_number(),
            body: part.body(),
            digests: part.digests.clone(),
        };
        debug!("Uploading part {} ({} bytes, attempt {})", part.part_number(), part.size, attempt);

        let call = timed(
            self.observer.as_ref(),
            Operation::UploadPart,
            self.backend.upload_part(request),
        );
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PartOutcome::Abandoned { index },
            result = call => result,
        };

        match result {
            Ok(etag) => PartOutcome::Uploaded {
                index,
                etag,
                checksum_sha256: part.digests.checksum_sha256.clone(),
            },
            Err(error) => PartOutcome::Failed { part, attempt, error },
        }
    }

    /// Wait out `delay`, stage the part again and make another attempt
    pub async fn retry(
        self,
        mut part: StagedPart,
        attempt: u32,
        delay: Duration,
        stager: DiskStager,
        cancel: CancellationToken,
    ) -> PartOutcome {
        let index = part.index;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PartOutcome::Abandoned { index },
            _ = tokio::time::sleep(delay) => {}
        }
        match stager.reserve(&cancel).await {
            Ok(slot) => part.stage(slot),
            Err(_) => return PartOutcome::Abandoned { index },
        }
        self.upload(part, attempt, cancel).await
    }
}

/// The spool file must still open and hold the whole part
async fn check_spool(part: &StagedPart) -> io::Result<()> {
    let file = tokio::fs::File::open(part.path()).await?;
    let length = file.metadata().await?.len();
    if length != part.size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("spool file of part {} holds {} of {} bytes", part.index, length, part.size),
        ));
    }
    Ok(())
}

/// Counts a part as uploading for as long as it lives
struct Uploading<'a>(&'a PipelineGauges);

impl<'a> Uploading<'a> {
    fn enter(gauges: &'a PipelineGauges) -> Self {
        gauges.enter_uploading();
        Self(gauges)
    }
}

impl Drop for Uploading<'_> {
    fn drop(&mut self) {
        self.0.leave_uploading();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::CreateMultipartUploadRequest;
    use crate::chunker::PartSpec;
    use crate::observability::LiveMetrics;
    use crate::{BackendErrorKind, MultipartConfig};
    use std::collections::BTreeMap;

    struct Fixture {
        dir: tempfile::TempDir,
        backend: MemoryBackend,
        metrics: Arc<LiveMetrics>,
        stager: DiskStager,
        uploader: PartUploader,
        gauges: Arc<PipelineGauges>,
    }

    async fn fixture(concurrency: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let metrics = Arc::new(LiveMetrics::new());
        let gauges = Arc::new(PipelineGauges::default());
        let config = MultipartConfig::default().with_temp_dir(dir.path());
        let stager = DiskStager::new(&config, metrics.clone(), gauges.clone());

        let upload_id = backend
            .create_multipart_upload(CreateMultipartUploadRequest {
                key: "clip.mov".to_string(),
                content_type: None,
                metadata: BTreeMap::new(),
                checksum_sha256: true,
            })
            .await
            .unwrap();
        let uploader = PartUploader::new(
            Arc::new(backend.clone()),
            metrics.clone(),
            UploadSemaphore::new(concurrency, metrics.clone()),
            gauges.clone(),
            "clip.mov".to_string(),
            upload_id,
        );
        Fixture {
            dir,
            backend,
            metrics,
            stager,
            uploader,
            gauges,
        }
    }

    async fn stage(stager: &DiskStager, index: u32, data: &[u8]) -> StagedPart {
        let mut writer = stager.open_part(index).await.unwrap();
        writer.write(data).await.unwrap();
        let slot = stager.reserve(&CancellationToken::new()).await.unwrap();
        writer
            .seal(
                PartSpec {
                    index,
                    offset: 0,
                    size: data.len() as u64,
                },
                slot,
            )
            .await
            .unwrap()
    }

    fn spool_files(dir: &tempfile::TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[tokio::test]
    async fn uploads_part_and_releases_spool() {
        let f = fixture(2).await;
        let part = stage(&f.stager, 0, b"frame data").await;
        let digest = part.digests.checksum_sha256.clone();

        let outcome = f.uploader.clone().upload(part, 1, CancellationToken::new()).await;
        match outcome {
            PartOutcome::Uploaded { index, checksum_sha256, .. } => {
                assert_eq!(index, 0);
                assert_eq!(checksum_sha256, digest);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(spool_files(&f.dir), 0);
        assert_eq!(f.gauges.snapshot().staged, 0);
        assert_eq!(f.gauges.snapshot().peak_uploading, 1);
        assert_eq!(f.metrics.request_count(Operation::UploadPart), 1);
    }

    #[tokio::test]
    async fn failed_part_stays_on_disk() {
        let f = fixture(2).await;
        f.backend.fail_part(1, BackendErrorKind::Transient, 1);
        let part = stage(&f.stager, 0, b"frame data").await;

        let outcome = f.uploader.clone().upload(part, 1, CancellationToken::new()).await;
        let PartOutcome::Failed { part, attempt, error } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(attempt, 1);
        assert!(error.is_retryable());
        assert!(!part.is_staged());
        assert_eq!(spool_files(&f.dir), 1);

        let outcome = f
            .uploader
            .clone()
            .retry(part, 2, Duration::from_millis(1), f.stager.clone(), CancellationToken::new())
            .await;
        assert!(matches!(outcome, PartOutcome::Uploaded { index: 0, .. }));
        assert_eq!(spool_files(&f.dir), 0);
    }

    #[tokio::test]
    async fn missing_spool_is_reported_before_sending() {
        let f = fixture(2).await;
        let part = stage(&f.stager, 0, b"frame data").await;
        std::fs::remove_file(part.path()).unwrap();

        let outcome = f.uploader.clone().upload(part, 1, CancellationToken::new()).await;
        let PartOutcome::SpoolLost { index, error } = outcome else {
            panic!("expected a lost spool");
        };
        assert_eq!(index, 0);
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
        assert_eq!(f.backend.upload_part_calls(), 0);
        assert_eq!(f.gauges.snapshot().peak_uploading, 0);
    }

    #[tokio::test]
    async fn truncated_spool_is_reported_before_sending() {
        let f = fixture(2).await;
        let part = stage(&f.stager, 0, b"frame data").await;
        std::fs::write(part.path(), b"frame").unwrap();

        let outcome = f.uploader.clone().upload(part, 1, CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            PartOutcome::SpoolLost { ref error, .. } if error.kind() == io::ErrorKind::UnexpectedEof
        ));
        assert_eq!(f.backend.upload_part_calls(), 0);
        assert_eq!(spool_files(&f.dir), 0);
    }

    #[tokio::test]
    async fn canceled_wait_abandons_part() {
        let f = fixture(1).await;
        let _busy = f.uploader.semaphore.acquire().await.unwrap();
        let part = stage(&f.stager, 0, b"frame data").await;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(f.uploader.clone().upload(part, 1, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.gauges.snapshot().staged, 1);

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), PartOutcome::Abandoned { index: 0 }));
        assert_eq!(spool_files(&f.dir), 0);
        assert_eq!(f.gauges.snapshot().staged, 0);
        assert_eq!(f.backend.upload_part_calls(), 0);
    }
}
