use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{
    sanitize_metadata, CompleteMultipartUploadRequest, CreateMultipartUploadRequest, ObjectBackend,
};
use crate::observability::{timed, Operation, UploadObserver};
use crate::part_uploader::{PartOutcome, PartUploader};
use crate::semaphore::UploadSemaphore;
use crate::stager::{DiskStager, StagedPart};
use crate::types::PipelineGauges;
use crate::{
    CompletedPart, CompletedUpload, MultipartConfig, MultipartError, MultipartResult, PartRecord,
    PartState, SessionState,
};

/// What the session wants done after a part outcome
#[derive(Debug)]
pub enum PartDecision {
    Continue,
    /// Send the part again as `attempt` after `delay`
    Retry {
        part: StagedPart,
        attempt: u32,
        delay: Duration,
    },
    Fatal(MultipartError),
}

/// Backend upload that still has to be aborted unless it completes. Every
/// abort path takes the id out first, so the backend sees a single abort
#[derive(Clone, Default)]
pub(crate) struct PendingAbort(Arc<parking_lot::Mutex<Option<String>>>);

impl PendingAbort {
    fn arm(&self, upload_id: String) {
        *self.0.lock() = Some(upload_id);
    }

    pub(crate) fn take(&self) -> Option<String> {
        self.0.lock().take()
    }
}

pub(crate) async fn abort_backend_upload(
    backend: &dyn ObjectBackend,
    observer: &dyn UploadObserver,
    key: &str,
    upload_id: &str,
) {
    let result = timed(
        observer,
        Operation::AbortMultipartUpload,
        backend.abort_multipart_upload(key, upload_id),
    )
    .await;
    match result {
        Ok(()) => info!("Aborted multipart upload {} for {}", upload_id, key),
        Err(err) => warn!("Backend abort of {} for {} failed: {}", upload_id, key, err),
    }
}

/// Owns one backend multipart upload from creation to completion or abort.
///
/// The backend upload is created lazily when the first part is submitted.
/// Each submitted part runs in its own task; outcomes are collected here and
/// decide between moving on, retrying the part, or failing the session.
pub struct SessionManager {
    backend: Arc<dyn ObjectBackend>,
    observer: Arc<dyn UploadObserver>,
    semaphore: UploadSemaphore,
    stager: DiskStager,
    gauges: Arc<PipelineGauges>,
    cancel: CancellationToken,
    key: String,
    content_type: Option<String>,
    metadata: BTreeMap<String, String>,
    checksums: bool,
    max_retries: u32,
    backoff: Duration,
    upload_id: Option<String>,
    pending_abort: PendingAbort,
    uploader: Option<PartUploader>,
    state: SessionState,
    parts: Vec<PartRecord>,
    tasks: JoinSet<PartOutcome>,
    completed: Option<CompletedUpload>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: Arc<dyn ObjectBackend>,
        observer: Arc<dyn UploadObserver>,
        semaphore: UploadSemaphore,
        stager: DiskStager,
        gauges: Arc<PipelineGauges>,
        config: &MultipartConfig,
        key: String,
        content_type: Option<String>,
        metadata: BTreeMap<String, String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            observer,
            semaphore,
            stager,
            gauges,
            cancel,
            key,
            content_type,
            metadata: sanitize_metadata(&metadata),
            checksums: !config.disable_content_hashes,
            max_retries: config.max_part_retries,
            backoff: config.part_retry_backoff,
            upload_id: None,
            pending_abort: PendingAbort::default(),
            uploader: None,
            state: SessionState::Open,
            parts: Vec::new(),
            tasks: JoinSet::new(),
            completed: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Backend upload id, once the first part has been submitted
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn parts(&self) -> &[PartRecord] {
        &self.parts
    }

    pub fn completed(&self) -> Option<&CompletedUpload> {
        self.completed.as_ref()
    }

    /// Token that stops every part task of this session
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Shared handle to the abort this session still owes the backend
    pub(crate) fn pending_abort(&self) -> PendingAbort {
        self.pending_abort.clone()
    }

    /// Part tasks that have not reported back yet
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    #[instrument(skip(self), fields(key = %self.key))]
    async fn open(&mut self) -> MultipartResult<PartUploader> {
        let request = CreateMultipartUploadRequest {
            key: self.key.clone(),
            content_type: self.content_type.clone(),
            metadata: self.metadata.clone(),
            checksum_sha256: self.checksums,
        };
        let upload_id = timed(
            self.observer.as_ref(),
            Operation::CreateMultipartUpload,
            self.backend.create_multipart_upload(request),
        )
        .await?;
        info!("Opened multipart upload {} for {}", upload_id, self.key);
        self.pending_abort.arm(upload_id.clone());

        let uploader = PartUploader::new(
            self.backend.clone(),
            self.observer.clone(),
            self.semaphore.clone(),
            self.gauges.clone(),
            self.key.clone(),
            upload_id.clone(),
        );
        self.upload_id = Some(upload_id);
        self.uploader = Some(uploader.clone());
        Ok(uploader)
    }

    /// Hand a sealed part to the upload pool, opening the backend upload on
    /// the first call
    pub async fn submit(&mut self, part: StagedPart) -> MultipartResult<()> {
        if self.state != SessionState::Open {
            return Err(MultipartError::invalid(format!(
                "cannot add parts to a session in state {:?}",
                self.state
            )));
        }
        if part.index as usize != self.parts.len() {
            return Err(MultipartError::invalid(format!(
                "part {} submitted out of order, expected {}",
                part.index,
                self.parts.len()
            )));
        }

        let uploader = match &self.uploader {
            Some(uploader) => uploader.clone(),
            None => self.open().await?,
        };

        let mut record = PartRecord::new(part.index, part.offset, part.size);
        record.state = PartState::Staged;
        record.spool_path = Some(part.path().to_path_buf());
        record.attempts = 1;
        self.parts.push(record);

        debug!("Staged part {} of {} ({} bytes)", part.index, self.key, part.size);
        self.tasks.spawn(uploader.upload(part, 1, self.cancel.clone()));
        Ok(())
    }

    /// Apply one part outcome to the session's records
    pub fn record(&mut self, outcome: PartOutcome) -> PartDecision {
        let index = outcome.index() as usize;
        let Some(record) = self.parts.get_mut(index) else {
            return PartDecision::Fatal(MultipartError::invalid(format!("outcome for unknown part {}", index)));
        };

        match outcome {
            PartOutcome::Uploaded {
                etag, checksum_sha256, ..
            } => {
                debug!("Part {} of {} uploaded", index, self.key);
                record.state = PartState::Uploaded;
                record.etag = Some(etag);
                record.checksum_sha256 = checksum_sha256;
                record.spool_path = None;
                PartDecision::Continue
            }
            PartOutcome::Failed { part, attempt, error } => {
                record.state = PartState::Failed;
                record.attempts = attempt;
                if error.is_retryable() && attempt <= self.max_retries {
                    let delay = self.backoff.saturating_mul(2u32.saturating_pow(attempt - 1));
                    warn!(
                        "Part {} of {} failed (attempt {}), retrying in {:?}: {}",
                        index, self.key, attempt, delay, error
                    );
                    record.state = PartState::Pending;
                    PartDecision::Retry {
                        part,
                        attempt: attempt + 1,
                        delay,
                    }
                } else {
                    record.spool_path = None;
                    error!("Part {} of {} failed after {} attempt(s): {}", index, self.key, attempt, error);
                    PartDecision::Fatal(error.into())
                }
            }
            PartOutcome::Abandoned { .. } => {
                record.state = PartState::Failed;
                record.spool_path = None;
                PartDecision::Fatal(MultipartError::SessionCanceled)
            }
            PartOutcome::SpoolLost { error, .. } => {
                record.state = PartState::Failed;
                record.spool_path = None;
                error!("Spool file of part {} of {} is unreadable: {}", index, self.key, error);
                PartDecision::Fatal(error.into())
            }
        }
    }

    fn handle(&mut self, joined: Result<PartOutcome, JoinError>) -> MultipartResult<()> {
        let outcome = joined
            .map_err(|e| MultipartError::invalid(format!("part upload task failed: {}", e)))?;
        match self.record(outcome) {
            PartDecision::Continue => Ok(()),
            PartDecision::Retry { part, attempt, delay } => {
                let uploader = self
                    .uploader
                    .clone()
                    .ok_or_else(|| MultipartError::invalid("retry before the upload was opened"))?;
                if let Some(record) = self.parts.get_mut(part.index as usize) {
                    record.attempts = attempt;
                }
                self.tasks.spawn(uploader.retry(
                    part,
                    attempt,
                    delay,
                    self.stager.clone(),
                    self.cancel.clone(),
                ));
                Ok(())
            }
            PartDecision::Fatal(err) => Err(err),
        }
    }

    /// Collect outcomes of tasks that already finished, without waiting
    pub fn poll(&mut self) -> MultipartResult<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            self.handle(joined)?;
        }
        Ok(())
    }

    /// Wait for the next task to report back. Returns immediately when no
    /// task is running
    pub async fn process_next(&mut self) -> MultipartResult<()> {
        match self.tasks.join_next().await {
            Some(joined) => self.handle(joined),
            None => Ok(()),
        }
    }

    /// Wait until every part, retries included, has been uploaded
    pub async fn drain(&mut self) -> MultipartResult<()> {
        while let Some(joined) = self.tasks.join_next().await {
            self.handle(joined)?;
        }
        Ok(())
    }

    /// Wait for all parts and assemble the object.
    ///
    /// On a terminal session this does nothing and returns the terminal state.
    /// An error leaves the session in `Completing` (or `Open` if parts were
    /// still failing); the caller is expected to abort.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn complete(&mut self) -> MultipartResult<SessionState> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        if self.cancel.is_cancelled() {
            return Err(MultipartError::SessionCanceled);
        }
        self.drain().await?;

        let upload_id = self
            .upload_id
            .clone()
            .ok_or_else(|| MultipartError::invalid("no parts were uploaded"))?;
        let mut parts = Vec::with_capacity(self.parts.len());
        for record in &self.parts {
            match (&record.state, &record.etag) {
                (PartState::Uploaded, Some(etag)) => parts.push(CompletedPart {
                    part_number: record.part_number(),
                    etag: etag.clone(),
                    checksum_sha256: record.checksum_sha256.clone(),
                }),
                _ => {
                    return Err(MultipartError::invalid(format!(
                        "part {} is {:?}, not uploaded",
                        record.index, record.state
                    )))
                }
            }
        }
        parts.sort_by_key(|part| part.part_number);
        self.state = SessionState::Completing;

        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            let request = CompleteMultipartUploadRequest {
                key: self.key.clone(),
                upload_id: upload_id.clone(),
                parts: parts.clone(),
            };
            let result = timed(
                self.observer.as_ref(),
                Operation::CompleteMultipartUpload,
                self.backend.complete_multipart_upload(request),
            )
            .await;
            match result {
                Ok(response) => {
                    self.pending_abort.take();
                    break response;
                }
                Err(err) if err.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.backoff.saturating_mul(2u32.saturating_pow(attempt - 1));
                    warn!("Completing {} failed (attempt {}), retrying in {:?}: {}", self.key, attempt, delay, err);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(MultipartError::SessionCanceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err.into()),
            }
        };

        let size_bytes = self.parts.iter().map(|p| p.size).sum();
        info!("Completed {} from {} parts ({} bytes)", self.key, parts.len(), size_bytes);
        self.completed = Some(CompletedUpload {
            key: self.key.clone(),
            upload_id: Some(upload_id),
            etag: response.etag,
            size_bytes,
            parts: parts.len() as u32,
        });
        self.state = SessionState::Completed;
        Ok(self.state)
    }

    /// Cancel all part tasks, delete their spool files and discard the
    /// backend upload. Always ends in `Aborted`; a second call is a no-op
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn abort(&mut self) -> SessionState {
        if self.state.is_terminal() {
            return self.state;
        }
        self.state = SessionState::Aborting;
        self.cancel.cancel();
        // Dropping the task futures drops their staged parts and spool files.
        self.tasks.shutdown().await;
        for record in &mut self.parts {
            if record.state != PartState::Uploaded {
                record.state = PartState::Failed;
            }
            record.spool_path = None;
        }

        if let Some(upload_id) = self.pending_abort.take() {
            abort_backend_upload(self.backend.as_ref(), self.observer.as_ref(), &self.key, &upload_id).await;
        }
        self.state = SessionState::Aborted;
        self.state
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.cancel.cancel();
        self.tasks.abort_all();

        let Some(upload_id) = self.pending_abort.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Dropped open upload {} for {} outside a runtime", upload_id, self.key);
            return;
        };
        let backend = self.backend.clone();
        let observer = self.observer.clone();
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            abort_backend_upload(backend.as_ref(), observer.as_ref(), &key, &upload_id).await;
        });
    }
}
