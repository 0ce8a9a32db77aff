use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use tokio::sync::watch;
use uuid::Uuid;

use super::{
    BackendResult, CompleteMultipartUploadRequest, CompleteMultipartUploadResponse,
    CreateMultipartUploadRequest, GetObjectResponse, ObjectBackend, ObjectHead, PutObjectRequest,
    PutObjectResponse, UploadPartCopyRequest, UploadPartRequest,
};
use crate::{BackendError, BackendErrorKind, ByteRange, Operation, PartDigests};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
    metadata: BTreeMap<String, String>,
    etag: String,
    /// Part sizes the object was assembled from, empty for single puts
    part_sizes: Vec<u64>,
}

#[derive(Debug, Clone)]
struct StoredPart {
    data: Bytes,
    etag: String,
    digests: PartDigests,
}

#[derive(Debug, Clone)]
struct PendingUpload {
    key: String,
    content_type: Option<String>,
    metadata: BTreeMap<String, String>,
    parts: BTreeMap<i32, StoredPart>,
}

/// Injected failure for a backend call
#[derive(Debug, Clone)]
struct Fault {
    kind: BackendErrorKind,
    remaining: usize,
}

#[derive(Default)]
struct CallCounters {
    create: AtomicUsize,
    upload_part: AtomicUsize,
    complete: AtomicUsize,
    abort: AtomicUsize,
    put: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Deterministic in-memory backend for tests and development.
///
/// Besides storing objects it can inject failures per part number or per
/// operation, hold every `upload_part` call at a gate, and report how many
/// calls of each kind it received.
#[derive(Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    uploads: Arc<RwLock<HashMap<String, PendingUpload>>>,
    part_faults: Arc<RwLock<HashMap<i32, Fault>>>,
    operation_faults: Arc<RwLock<HashMap<Operation, Fault>>>,
    counters: Arc<CallCounters>,
    gate: Arc<watch::Sender<bool>>,
    upload_delay: Option<Duration>,
    min_part_size: u64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            uploads: Arc::new(RwLock::new(HashMap::new())),
            part_faults: Arc::new(RwLock::new(HashMap::new())),
            operation_faults: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(CallCounters::default()),
            gate: Arc::new(gate),
            upload_delay: None,
            min_part_size: 0,
        }
    }

    /// Sleep this long inside every `upload_part` call
    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    /// Reject completion when a non-final part is smaller than `bytes`, like S3 does
    pub fn with_min_part_size(mut self, bytes: u64) -> Self {
        self.min_part_size = bytes;
        self
    }

    /// Fail the next `times` uploads of `part_number` with `kind`
    pub fn fail_part(&self, part_number: i32, kind: BackendErrorKind, times: usize) {
        self.part_faults
            .write()
            .insert(part_number, Fault { kind, remaining: times });
    }

    /// Fail the next `times` calls of `operation` with `kind`
    pub fn fail_operation(&self, operation: Operation, kind: BackendErrorKind, times: usize) {
        self.operation_faults
            .write()
            .insert(operation, Fault { kind, remaining: times });
    }

    /// Block every `upload_part` call until [`release_uploads`](Self::release_uploads)
    pub fn hold_uploads(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_uploads(&self) {
        self.gate.send_replace(true);
    }

    /// Stored object content
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).map(|o| o.data.clone())
    }

    pub fn object_metadata(&self, key: &str) -> Option<BTreeMap<String, String>> {
        self.objects.read().get(key).map(|o| o.metadata.clone())
    }

    /// Sizes of the parts a completed multipart object was assembled from
    pub fn object_part_sizes(&self, key: &str) -> Vec<u64> {
        self.objects
            .read()
            .get(key)
            .map(|o| o.part_sizes.clone())
            .unwrap_or_default()
    }

    /// Multipart uploads neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.uploads.read().len()
    }

    /// Digests received with each part of a pending upload
    pub fn part_digests(&self, upload_id: &str) -> Vec<PartDigests> {
        self.uploads
            .read()
            .get(upload_id)
            .map(|u| u.parts.values().map(|p| p.digests.clone()).collect())
            .unwrap_or_default()
    }

    /// Sizes of the parts received for a pending upload, by part number
    pub fn part_sizes(&self, upload_id: &str) -> Vec<u64> {
        self.uploads
            .read()
            .get(upload_id)
            .map(|u| u.parts.values().map(|p| p.data.len() as u64).collect())
            .unwrap_or_default()
    }

    pub fn create_calls(&self) -> usize {
        self.counters.create.load(Ordering::SeqCst)
    }

    pub fn upload_part_calls(&self) -> usize {
        self.counters.upload_part.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.counters.complete.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.counters.abort.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.counters.put.load(Ordering::SeqCst)
    }

    /// `upload_part` calls currently inside the backend
    pub fn in_flight_uploads(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight_uploads(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }

    fn take_fault<K>(faults: &RwLock<HashMap<K, Fault>>, key: &K) -> Option<BackendErrorKind>
    where
        K: std::hash::Hash + Eq,
    {
        let mut faults = faults.write();
        let fault = faults.get_mut(key)?;
        if fault.remaining == 0 {
            return None;
        }
        fault.remaining -= 1;
        Some(fault.kind)
    }

    fn check_operation(&self, operation: Operation) -> BackendResult<()> {
        match Self::take_fault(&self.operation_faults, &operation) {
            Some(kind) => Err(BackendError::new(kind, operation, "injected failure")),
            None => Ok(()),
        }
    }

    fn etag_of(data: &[u8]) -> String {
        format!("{:x}", Md5::digest(data))
    }

    fn slice(data: &Bytes, range: Option<ByteRange>) -> Bytes {
        let Some(range) = range else {
            return data.clone();
        };
        let len = data.len() as u64;
        let start = range.start.min(len);
        let end = range.end.map_or(len, |end| (end + 1).min(len));
        data.slice(start as usize..end.max(start) as usize)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks one `upload_part` call inside the backend
struct InFlight<'a>(&'a CallCounters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a CallCounters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn put_object(&self, request: PutObjectRequest) -> BackendResult<PutObjectResponse> {
        self.counters.put.fetch_add(1, Ordering::SeqCst);
        self.check_operation(Operation::PutObject)?;

        let data = request
            .body
            .read_all()
            .await
            .map_err(|e| BackendError::permanent(Operation::PutObject, e.to_string()))?;
        let etag = Self::etag_of(&data);
        self.objects.write().insert(
            request.key,
            StoredObject {
                data,
                content_type: request.content_type,
                metadata: request.metadata,
                etag: etag.clone(),
                part_sizes: Vec::new(),
            },
        );
        Ok(PutObjectResponse { etag: Some(etag) })
    }

    async fn get_object(&self, key: &str, range: Option<ByteRange>) -> BackendResult<GetObjectResponse> {
        self.check_operation(Operation::GetObject)?;
        let object = self
            .objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::not_found(Operation::GetObject, key))?;

        let data = Self::slice(&object.data, range);
        Ok(GetObjectResponse {
            size_bytes: data.len() as u64,
            stream: Box::pin(futures::stream::once(async move { Ok(data) })),
            content_type: object.content_type,
            etag: Some(object.etag),
        })
    }

    async fn head_object(&self, key: &str) -> BackendResult<ObjectHead> {
        self.check_operation(Operation::HeadObject)?;
        let objects = self.objects.read();
        let object = objects
            .get(key)
            .ok_or_else(|| BackendError::not_found(Operation::HeadObject, key))?;
        Ok(ObjectHead {
            size_bytes: object.data.len() as u64,
            content_type: object.content_type.clone(),
            etag: Some(object.etag.clone()),
            metadata: object.metadata.clone(),
        })
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.check_operation(Operation::DeleteObject)?;
        self.objects.write().remove(key);
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> BackendResult<()> {
        self.check_operation(Operation::DeleteObjects)?;
        let mut objects = self.objects.write();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn create_multipart_upload(&self, request: CreateMultipartUploadRequest) -> BackendResult<String> {
        self.counters.create.fetch_add(1, Ordering::SeqCst);
        self.check_operation(Operation::CreateMultipartUpload)?;

        let upload_id = Uuid::new_v4().simple().to_string();
        self.uploads.write().insert(
            upload_id.clone(),
            PendingUpload {
                key: request.key,
                content_type: request.content_type,
                metadata: request.metadata,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(&self, request: UploadPartRequest) -> BackendResult<String> {
        self.counters.upload_part.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.counters);

        let mut gate = self.gate.subscribe();
        // The sender lives as long as self, so this only fails if it is dropped mid-call.
        let _ = gate.wait_for(|open| *open).await;
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }

        self.check_operation(Operation::UploadPart)?;
        if let Some(kind) = Self::take_fault(&self.part_faults, &request.part_number) {
            return Err(BackendError::new(
                kind,
                Operation::UploadPart,
                format!("injected failure for part {}", request.part_number),
            ));
        }

        let data = request
            .body
            .read_all()
            .await
            .map_err(|e| BackendError::permanent(Operation::UploadPart, e.to_string()))?;
        if data.len() as u64 != request.body.len() {
            return Err(BackendError::permanent(
                Operation::UploadPart,
                format!("declared {} bytes, received {}", request.body.len(), data.len()),
            ));
        }

        let etag = Self::etag_of(&data);
        let mut uploads = self.uploads.write();
        let upload = uploads
            .get_mut(&request.upload_id)
            .ok_or_else(|| BackendError::not_found(Operation::UploadPart, request.upload_id.clone()))?;
        upload.parts.insert(
            request.part_number,
            StoredPart {
                data,
                etag: etag.clone(),
                digests: request.digests,
            },
        );
        Ok(etag)
    }

    async fn upload_part_copy(&self, request: UploadPartCopyRequest) -> BackendResult<String> {
        self.check_operation(Operation::UploadPartCopy)?;
        let source = self
            .objects
            .read()
            .get(&request.source_key)
            .cloned()
            .ok_or_else(|| BackendError::not_found(Operation::UploadPartCopy, request.source_key.clone()))?;

        let data = Self::slice(&source.data, request.source_range);
        let etag = Self::etag_of(&data);
        let mut uploads = self.uploads.write();
        let upload = uploads
            .get_mut(&request.upload_id)
            .ok_or_else(|| BackendError::not_found(Operation::UploadPartCopy, request.upload_id.clone()))?;
        upload.parts.insert(
            request.part_number,
            StoredPart {
                data,
                etag: etag.clone(),
                digests: PartDigests::default(),
            },
        );
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartUploadRequest,
    ) -> BackendResult<CompleteMultipartUploadResponse> {
        self.counters.complete.fetch_add(1, Ordering::SeqCst);
        self.check_operation(Operation::CompleteMultipartUpload)?;

        let op = Operation::CompleteMultipartUpload;
        let mut uploads = self.uploads.write();
        let upload = uploads
            .get(&request.upload_id)
            .ok_or_else(|| BackendError::not_found(op, request.upload_id.clone()))?;
        if upload.key != request.key {
            return Err(BackendError::permanent(op, "upload belongs to a different key"));
        }
        if request.parts.is_empty() {
            return Err(BackendError::permanent(op, "no parts given"));
        }
        if request.parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(BackendError::permanent(op, "parts are not in ascending order"));
        }

        let mut data = BytesMut::new();
        let mut etags = String::new();
        let mut part_sizes = Vec::with_capacity(request.parts.len());
        let last = request.parts.len() - 1;
        for (position, part) in request.parts.iter().enumerate() {
            let stored = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| BackendError::permanent(op, format!("part {} was never uploaded", part.part_number)))?;
            if stored.etag != part.etag {
                return Err(BackendError::permanent(op, format!("etag mismatch for part {}", part.part_number)));
            }
            if position < last && (stored.data.len() as u64) < self.min_part_size {
                return Err(BackendError::permanent(op, format!("part {} is too small", part.part_number)));
            }
            data.extend_from_slice(&stored.data);
            etags.push_str(&stored.etag);
            part_sizes.push(stored.data.len() as u64);
        }

        let etag = format!("{}-{}", Self::etag_of(etags.as_bytes()), request.parts.len());
        let upload = uploads
            .remove(&request.upload_id)
            .ok_or_else(|| BackendError::not_found(op, request.upload_id.clone()))?;
        self.objects.write().insert(
            request.key,
            StoredObject {
                data: data.freeze(),
                content_type: upload.content_type,
                metadata: upload.metadata,
                etag: etag.clone(),
                part_sizes,
            },
        );
        Ok(CompleteMultipartUploadResponse { etag: Some(etag) })
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> BackendResult<()> {
        self.counters.abort.fetch_add(1, Ordering::SeqCst);
        self.check_operation(Operation::AbortMultipartUpload)?;
        self.uploads
            .write()
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::not_found(Operation::AbortMultipartUpload, upload_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ObjectBody;
    use crate::CompletedPart;
    use futures::TryStreamExt;

    fn part(upload_id: &str, number: i32, data: &'static [u8]) -> UploadPartRequest {
        UploadPartRequest {
            key: "video.mp4".to_string(),
            upload_id: upload_id.to_string(),
            part_number: number,
            body: ObjectBody::Bytes(Bytes::from_static(data)),
            digests: PartDigests::default(),
        }
    }

    async fn create(backend: &MemoryBackend) -> String {
        backend
            .create_multipart_upload(CreateMultipartUploadRequest {
                key: "video.mp4".to_string(),
                content_type: Some("video/mp4".to_string()),
                metadata: BTreeMap::new(),
                checksum_sha256: false,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn assembles_parts_in_part_number_order() {
        let backend = MemoryBackend::new();
        let upload_id = create(&backend).await;

        let second = backend.upload_part(part(&upload_id, 2, b"world")).await.unwrap();
        let first = backend.upload_part(part(&upload_id, 1, b"hello ")).await.unwrap();

        backend
            .complete_multipart_upload(CompleteMultipartUploadRequest {
                key: "video.mp4".to_string(),
                upload_id: upload_id.clone(),
                parts: vec![
                    CompletedPart { part_number: 1, etag: first, checksum_sha256: None },
                    CompletedPart { part_number: 2, etag: second, checksum_sha256: None },
                ],
            })
            .await
            .unwrap();

        assert_eq!(backend.object("video.mp4").unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(backend.object_part_sizes("video.mp4"), vec![6, 5]);
        assert_eq!(backend.pending_uploads(), 0);

        let got = backend
            .get_object("video.mp4", Some(ByteRange::new(6, Some(8))))
            .await
            .unwrap();
        let chunks: Vec<Bytes> = got.stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"wor");
    }

    #[tokio::test]
    async fn injected_part_faults_run_out() {
        let backend = MemoryBackend::new();
        let upload_id = create(&backend).await;
        backend.fail_part(1, BackendErrorKind::Transient, 1);

        let err = backend.upload_part(part(&upload_id, 1, b"abc")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(backend.upload_part(part(&upload_id, 1, b"abc")).await.is_ok());
        assert_eq!(backend.upload_part_calls(), 2);
    }

    #[tokio::test]
    async fn enforces_minimum_size_for_non_final_parts() {
        let backend = MemoryBackend::new().with_min_part_size(4);
        let upload_id = create(&backend).await;
        let first = backend.upload_part(part(&upload_id, 1, b"ab")).await.unwrap();
        let second = backend.upload_part(part(&upload_id, 2, b"cd")).await.unwrap();

        let err = backend
            .complete_multipart_upload(CompleteMultipartUploadRequest {
                key: "video.mp4".to_string(),
                upload_id,
                parts: vec![
                    CompletedPart { part_number: 1, etag: first, checksum_sha256: None },
                    CompletedPart { part_number: 2, etag: second, checksum_sha256: None },
                ],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Permanent);
    }

    #[tokio::test]
    async fn abort_discards_upload() {
        let backend = MemoryBackend::new();
        let upload_id = create(&backend).await;
        backend.upload_part(part(&upload_id, 1, b"abc")).await.unwrap();

        backend.abort_multipart_upload("video.mp4", &upload_id).await.unwrap();
        assert_eq!(backend.pending_uploads(), 0);
        assert_eq!(backend.abort_calls(), 1);
        assert!(backend.object("video.mp4").is_none());
    }
}
