use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument};

use crate::backend::{ObjectBackend, ObjectBody, PutObjectRequest};
use crate::chunker::{ChunkEvent, Chunker};
use crate::observability::{timed, Operation, UploadObserver};
use crate::session::{abort_backend_upload, PendingAbort, SessionManager};
use crate::stager::{DiskStager, SpoolWriter, StagingSlot};
use crate::types::PipelineGauges;
use crate::{
    CompletedUpload, MultipartError, MultipartResult, PipelineStats, SessionState, UploadOptions,
};

/// Producer side of one upload.
///
/// Bytes written here are cut into parts, spooled to disk and handed to the
/// upload pool. `write` blocks while the staging buffer is full. Any fatal
/// error aborts the backend upload before it is returned, and the writer
/// accepts no further data afterwards.
///
/// Cancelling the upload's token does not wait for the next call: a watch
/// task deletes the spool file of the part being filled and aborts the
/// backend upload right away. Part tasks drop their own spool files.
///
/// Dropping a writer that is neither finished nor aborted cancels its part
/// uploads and aborts the backend upload in the background.
pub struct UploadWriter {
    id: String,
    options: UploadOptions,
    chunker: Chunker,
    stager: DiskStager,
    session: SessionManager,
    backend: Arc<dyn ObjectBackend>,
    observer: Arc<dyn UploadObserver>,
    gauges: Arc<PipelineGauges>,
    cancel: CancellationToken,
    spool: Option<SpoolWriter>,
    completed: Option<CompletedUpload>,
    failed: bool,
    _watch: Option<DropGuard>,
}

impl UploadWriter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        options: UploadOptions,
        chunker: Chunker,
        stager: DiskStager,
        session: SessionManager,
        backend: Arc<dyn ObjectBackend>,
        observer: Arc<dyn UploadObserver>,
        gauges: Arc<PipelineGauges>,
        cancel: CancellationToken,
    ) -> Self {
        let watch = watch_cancellation(
            &id,
            session.key(),
            stager.clone(),
            session.pending_abort(),
            backend.clone(),
            observer.clone(),
            cancel.clone(),
        );
        Self {
            id,
            options,
            chunker,
            stager,
            session,
            backend,
            observer,
            gauges,
            cancel,
            spool: None,
            completed: None,
            failed: false,
            _watch: watch,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Object key the upload is assembled under
    pub fn key(&self) -> &str {
        self.session.key()
    }

    pub fn bytes_written(&self) -> u64 {
        self.chunker.bytes_seen()
    }

    /// `Aborting` after a cancellation until the writer is called again
    pub fn state(&self) -> SessionState {
        if self.completed.is_some() {
            return SessionState::Completed;
        }
        let state = self.session.state();
        if !state.is_terminal() && self.cancel.is_cancelled() {
            return SessionState::Aborting;
        }
        state
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.session.upload_id()
    }

    /// Current and peak number of staged and uploading parts
    pub fn stats(&self) -> PipelineStats {
        self.gauges.snapshot()
    }

    /// Append bytes to the upload
    pub async fn write(&mut self, bytes: Bytes) -> MultipartResult<()> {
        self.ensure_writable()?;
        if self.cancel.is_cancelled() {
            return Err(self.fail(MultipartError::SessionCanceled).await);
        }
        match self.write_inner(bytes).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// End of stream: seal the final part, wait for all uploads and assemble
    /// the object. Calling it again after success returns the same result
    #[instrument(skip(self), fields(id = %self.id, key = %self.session.key()))]
    pub async fn finish(&mut self) -> MultipartResult<CompletedUpload> {
        if let Some(completed) = &self.completed {
            return Ok(completed.clone());
        }
        self.ensure_writable()?;
        if self.cancel.is_cancelled() {
            return Err(self.fail(MultipartError::SessionCanceled).await);
        }

        match self.finish_inner().await {
            Ok(completed) => {
                self.completed = Some(completed.clone());
                self._watch = None;
                Ok(completed)
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Stop the upload and discard everything sent so far
    #[instrument(skip(self), fields(id = %self.id, key = %self.session.key()))]
    pub async fn abort(&mut self) -> SessionState {
        if self.completed.is_some() {
            return SessionState::Completed;
        }
        self.failed = true;
        self.spool = None;
        self.session.abort().await
    }

    fn ensure_writable(&self) -> MultipartResult<()> {
        if self.completed.is_some() {
            return Err(MultipartError::invalid("upload is already completed"));
        }
        if self.failed || self.session.state().is_terminal() {
            return Err(MultipartError::SessionCanceled);
        }
        Ok(())
    }

    async fn write_inner(&mut self, bytes: Bytes) -> MultipartResult<()> {
        let events = self.chunker.push(bytes)?;
        self.apply(events).await?;
        self.session.poll()
    }

    async fn finish_inner(&mut self) -> MultipartResult<CompletedUpload> {
        let events = self.chunker.finish()?;
        self.apply(events).await?;

        if self.session.upload_id().is_none() {
            return self.put_empty().await;
        }
        self.session.complete().await?;
        self.session
            .completed()
            .cloned()
            .ok_or(MultipartError::SessionCanceled)
    }

    async fn apply(&mut self, events: Vec<ChunkEvent>) -> MultipartResult<()> {
        for event in events {
            match event {
                ChunkEvent::Data { index, bytes } => {
                    if !matches!(&self.spool, Some(spool) if spool.index() == index) {
                        self.spool = None;
                        self.spool = Some(self.stager.open_part(index).await?);
                        // Opened after the watch task already cleaned up.
                        if self.cancel.is_cancelled() {
                            return Err(MultipartError::SessionCanceled);
                        }
                    }
                    if let Some(spool) = self.spool.as_mut() {
                        spool.write(&bytes).await?;
                    }
                }
                ChunkEvent::Seal(spec) => {
                    let spool = self
                        .spool
                        .take()
                        .ok_or_else(|| MultipartError::invalid(format!("part {} sealed before any data", spec.index)))?;
                    let slot = self.reserve_slot().await?;
                    let part = spool.seal(spec, slot).await?;
                    self.session.submit(part).await?;
                }
            }
        }
        Ok(())
    }

    /// Wait for a staging slot while still reacting to part outcomes, so a
    /// fatal failure is not hidden behind a full buffer
    async fn reserve_slot(&mut self) -> MultipartResult<StagingSlot> {
        loop {
            tokio::select! {
                slot = self.stager.reserve(&self.cancel) => return slot,
                handled = self.session.process_next(), if self.session.pending_tasks() > 0 => handled?,
            }
        }
    }

    /// A zero-byte stream is stored with a single put
    async fn put_empty(&self) -> MultipartResult<CompletedUpload> {
        let key = self.session.key().to_string();
        let mut request = PutObjectRequest::new(key.clone(), ObjectBody::empty())
            .with_metadata(self.options.metadata.clone());
        request.content_type = self.options.content_type.clone();

        let response = timed(
            self.observer.as_ref(),
            Operation::PutObject,
            self.backend.put_object(request),
        )
        .await?;
        info!("Stored empty upload {} as {}", self.id, key);
        Ok(CompletedUpload {
            key,
            upload_id: None,
            etag: response.etag,
            size_bytes: 0,
            parts: 0,
        })
    }

    async fn fail(&mut self, err: MultipartError) -> MultipartError {
        error!("Upload {} failed: {}", self.id, err);
        self.failed = true;
        self.spool = None;
        self.session.abort().await;
        err
    }
}

/// Spawn the task that cleans up after a cancellation while the writer is
/// idle. It stops once the returned guard is dropped. Without a runtime the
/// writer notices the cancellation on its next call instead
fn watch_cancellation(
    id: &str,
    key: &str,
    stager: DiskStager,
    pending: PendingAbort,
    backend: Arc<dyn ObjectBackend>,
    observer: Arc<dyn UploadObserver>,
    cancel: CancellationToken,
) -> Option<DropGuard> {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("No runtime to watch upload {} for cancellation", id);
        return None;
    };
    let retired = CancellationToken::new();
    let stop = retired.clone();
    let id = id.to_string();
    let key = key.to_string();
    handle.spawn(async move {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = stop.cancelled() => return,
        }
        stager.discard_filling();
        if let Some(upload_id) = pending.take() {
            info!("Upload {} canceled, aborting {}", id, upload_id);
            abort_backend_upload(backend.as_ref(), observer.as_ref(), &key, &upload_id).await;
        }
    });
    Some(retired.drop_guard())
}
