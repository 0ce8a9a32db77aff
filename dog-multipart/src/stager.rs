use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::Md5;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::ObjectBody;
use crate::chunker::PartSpec;
use crate::observability::UploadObserver;
use crate::types::PipelineGauges;
use crate::{MultipartConfig, MultipartError, MultipartResult, PartDigests};

const SPOOL_PREFIX: &str = "dog-multipart-";

/// Spools parts to local temporary files and bounds how many sealed parts
/// may wait on disk for an upload permit.
///
/// Every spool file is owned by a [`TempPath`] guard, so it is removed as soon
/// as the [`SpoolWriter`] or [`StagedPart`] holding it is dropped, whichever
/// path (upload, failure, abort, task cancellation) gets there. The guard of
/// the part still being filled sits in the stager, so a cancellation can
/// remove that file without going through the writer.
#[derive(Clone)]
pub struct DiskStager {
    dir: Option<PathBuf>,
    filling: Arc<Mutex<Option<TempPath>>>,
    slots: Arc<Semaphore>,
    hashing: bool,
    observer: Arc<dyn UploadObserver>,
    gauges: Arc<PipelineGauges>,
}

impl DiskStager {
    pub(crate) fn new(
        config: &MultipartConfig,
        observer: Arc<dyn UploadObserver>,
        gauges: Arc<PipelineGauges>,
    ) -> Self {
        Self {
            dir: config.temp_dir.clone(),
            filling: Arc::new(Mutex::new(None)),
            slots: Arc::new(Semaphore::new(config.max_buffered_parts)),
            hashing: !config.disable_content_hashes,
            observer,
            gauges,
        }
    }

    /// Slots not taken by staged parts
    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for room to stage one more part. This is where the producer
    /// blocks while `max_buffered_parts` parts are waiting to upload
    pub async fn reserve(&self, cancel: &CancellationToken) -> MultipartResult<StagingSlot> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MultipartError::SessionCanceled),
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| MultipartError::SessionCanceled)?
            }
        };
        self.gauges.enter_staged();
        Ok(StagingSlot {
            _permit: permit,
            gauges: self.gauges.clone(),
        })
    }

    /// Create the spool file for part `index`
    pub async fn open_part(&self, index: u32) -> MultipartResult<SpoolWriter> {
        let dir = self.dir.clone();
        let named = tokio::task::spawn_blocking(move || {
            let mut builder = tempfile::Builder::new();
            builder.prefix(SPOOL_PREFIX);
            match dir {
                Some(dir) => builder.tempfile_in(dir),
                None => builder.tempfile(),
            }
        })
        .await
        .map_err(std::io::Error::other)??;

        let (file, guard) = named.into_parts();
        let path = guard.to_path_buf();
        debug!("Spooling part {} to {}", index, path.display());
        *self.filling.lock() = Some(guard);
        Ok(SpoolWriter {
            index,
            file: File::from_std(file),
            path,
            filling: self.filling.clone(),
            written: 0,
            md5: self.hashing.then(Md5::new),
            sha256: self.hashing.then(Sha256::new),
            observer: self.observer.clone(),
        })
    }

    /// Delete the spool file of the part being filled, if any. A later
    /// `seal` of that part fails with `SessionCanceled`
    pub fn discard_filling(&self) -> bool {
        let discarded = self.filling.lock().take();
        if let Some(path) = &discarded {
            debug!("Discarded spool file {}", path.display());
        }
        discarded.is_some()
    }
}

/// Reservation of one staged-part slot. Released on drop
#[derive(Debug)]
pub struct StagingSlot {
    _permit: OwnedSemaphorePermit,
    gauges: Arc<PipelineGauges>,
}

impl Drop for StagingSlot {
    fn drop(&mut self) {
        self.gauges.leave_staged();
    }
}

/// Open spool file of the part currently being filled
pub struct SpoolWriter {
    index: u32,
    file: File,
    path: PathBuf,
    filling: Arc<Mutex<Option<TempPath>>>,
    written: u64,
    md5: Option<Md5>,
    sha256: Option<Sha256>,
    observer: Arc<dyn UploadObserver>,
}

impl SpoolWriter {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&mut self, bytes: &[u8]) -> MultipartResult<()> {
        let started = Instant::now();
        self.file.write_all(bytes).await?;
        self.observer.record_disk_write_duration(started.elapsed());

        if let Some(md5) = self.md5.as_mut() {
            md5.update(bytes);
        }
        if let Some(sha256) = self.sha256.as_mut() {
            sha256.update(bytes);
        }
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Flush and close the spool file. `slot` stays with the part until an
    /// upload permit is acquired for it
    pub async fn seal(mut self, spec: PartSpec, slot: StagingSlot) -> MultipartResult<StagedPart> {
        if spec.index != self.index || spec.size != self.written {
            return Err(MultipartError::invalid(format!(
                "part {} sealed with {} bytes but {} were spooled for part {}",
                spec.index, spec.size, self.written, self.index
            )));
        }
        self.file.flush().await?;
        let path = self.take_guard().ok_or(MultipartError::SessionCanceled)?;

        let digests = PartDigests {
            content_md5: self.md5.take().map(|h| STANDARD.encode(h.finalize())),
            checksum_sha256: self.sha256.take().map(|h| STANDARD.encode(h.finalize())),
        };
        Ok(StagedPart {
            index: spec.index,
            offset: spec.offset,
            size: spec.size,
            digests,
            path,
            slot: Some(slot),
        })
    }

    /// The file guard, unless the stager already discarded this spool
    fn take_guard(&self) -> Option<TempPath> {
        let mut filling = self.filling.lock();
        match filling.as_deref() {
            Some(path) if path == self.path.as_path() => filling.take(),
            _ => None,
        }
    }
}

impl Drop for SpoolWriter {
    fn drop(&mut self) {
        drop(self.take_guard());
    }
}

/// A sealed part on disk, waiting for or going through upload
pub struct StagedPart {
    pub index: u32,
    pub offset: u64,
    pub size: u64,
    pub digests: PartDigests,
    path: TempPath,
    slot: Option<StagingSlot>,
}

impl StagedPart {
    /// Backend part number (1-based)
    pub fn part_number(&self) -> i32 {
        self.index as i32 + 1
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn body(&self) -> ObjectBody {
        ObjectBody::File {
            path: self.path.to_path_buf(),
            length: self.size,
        }
    }

    /// Whether the part currently counts against `max_buffered_parts`
    pub fn is_staged(&self) -> bool {
        self.slot.is_some()
    }

    pub(crate) fn stage(&mut self, slot: StagingSlot) {
        self.slot = Some(slot);
    }

    /// Give the buffer slot back once the part moves to uploading
    pub(crate) fn release_slot(&mut self) {
        self.slot = None;
    }
}

impl std::fmt::Debug for StagedPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedPart")
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("path", &self.path.to_path_buf())
            .field("staged", &self.slot.is_some())
            .finish()
    }
}
