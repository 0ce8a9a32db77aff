use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{ObjectBackend, ObjectBody, PutObjectRequest};
use crate::observability::{timed, Operation, UploadObserver};
use crate::{BackendError, MultipartConfig, MultipartError, MultipartResult, UploadOptions};

/// Persistent description of a resumable upload, stored as `<id>.info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub id: String,
    pub object_key: String,
    /// Declared length; `None` while the client has not announced it
    pub size: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Backend multipart upload id, once one exists
    #[serde(default)]
    pub upload_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UploadInfo {
    pub fn new<S: Into<String>>(id: S, config: &MultipartConfig, options: &UploadOptions) -> Self {
        let id = id.into();
        Self {
            object_key: config.object_key(&id),
            id,
            size: options.size,
            content_type: options.content_type.clone(),
            metadata: options.metadata.clone(),
            upload_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_upload_id<S: Into<String>>(mut self, upload_id: S) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    /// Options to resume the upload with
    pub fn options(&self) -> UploadOptions {
        UploadOptions {
            size: self.size,
            content_type: self.content_type.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Reads and writes `.info` sidecars and removes finished uploads
#[derive(Clone)]
pub struct InfoStore {
    backend: Arc<dyn ObjectBackend>,
    observer: Arc<dyn UploadObserver>,
    config: MultipartConfig,
}

impl InfoStore {
    pub fn new(backend: Arc<dyn ObjectBackend>, observer: Arc<dyn UploadObserver>, config: MultipartConfig) -> Self {
        Self {
            backend,
            observer,
            config,
        }
    }

    pub async fn save(&self, info: &UploadInfo) -> MultipartResult<()> {
        let body = serde_json::to_vec(info)?;
        let request = PutObjectRequest::new(self.config.info_key(&info.id), ObjectBody::Bytes(body.into()))
            .with_content_type("application/json");
        timed(
            self.observer.as_ref(),
            Operation::PutInfoObject,
            self.backend.put_object(request),
        )
        .await?;
        debug!("Saved upload info for {}", info.id);
        Ok(())
    }

    pub async fn load(&self, id: &str) -> MultipartResult<UploadInfo> {
        let key = self.config.info_key(id);
        let response = timed(
            self.observer.as_ref(),
            Operation::GetInfoObject,
            self.backend.get_object(&key, None),
        )
        .await?;

        let body = response
            .stream
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .map_err(|e| BackendError::transient(Operation::GetInfoObject, e.to_string()))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Delete the assembled object and its `.info` sidecar
    pub async fn terminate(&self, id: &str) -> MultipartResult<()> {
        let keys = vec![self.config.object_key(id), self.config.info_key(id)];
        timed(
            self.observer.as_ref(),
            Operation::DeleteObjects,
            self.backend.delete_objects(&keys),
        )
        .await?;
        debug!("Terminated upload {}", id);
        Ok(())
    }

    /// Size of the assembled object
    pub async fn object_size(&self, id: &str) -> MultipartResult<u64> {
        let head = timed(
            self.observer.as_ref(),
            Operation::HeadObject,
            self.backend.head_object(&self.config.object_key(id)),
        )
        .await
        .map_err(|e| match e.kind {
            crate::BackendErrorKind::NotFound => MultipartError::not_found(self.config.object_key(id)),
            _ => e.into(),
        })?;
        Ok(head.size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::observability::LiveMetrics;

    fn store() -> (InfoStore, MemoryBackend, Arc<LiveMetrics>) {
        let backend = MemoryBackend::new();
        let metrics = Arc::new(LiveMetrics::new());
        let config = MultipartConfig::default()
            .with_object_prefix("uploads/")
            .with_metadata_object_prefix("meta/");
        (InfoStore::new(Arc::new(backend.clone()), metrics.clone(), config), backend, metrics)
    }

    #[tokio::test]
    async fn info_round_trips_through_backend() {
        let (store, backend, metrics) = store();
        let options = UploadOptions::new()
            .with_size(42)
            .with_content_type("image/png")
            .with_metadata("filename", "cat.png");
        let info = UploadInfo::new("abc", &MultipartConfig::default().with_object_prefix("uploads/"), &options)
            .with_upload_id("mpu-1");

        store.save(&info).await.unwrap();
        assert!(backend.object("meta/abc.info").is_some());
        assert_eq!(store.load("abc").await.unwrap(), info);
        assert_eq!(info.object_key, "uploads/abc");
        assert_eq!(info.options().size, Some(42));

        assert_eq!(metrics.request_count(Operation::PutInfoObject), 1);
        assert_eq!(metrics.request_count(Operation::GetInfoObject), 1);
    }

    #[tokio::test]
    async fn missing_info_is_not_found() {
        let (store, _, _) = store();
        let err = store.load("nope").await.unwrap_err();
        assert!(matches!(err, MultipartError::NotFound { .. }));
    }

    #[tokio::test]
    async fn terminate_removes_object_and_info() {
        let (store, backend, _) = store();
        backend
            .put_object(PutObjectRequest::new("uploads/abc", ObjectBody::Bytes("data".into())))
            .await
            .unwrap();
        let info = UploadInfo::new("abc", &MultipartConfig::default(), &UploadOptions::new());
        store.save(&info).await.unwrap();
        assert_eq!(store.object_size("abc").await.unwrap(), 4);

        store.terminate("abc").await.unwrap();
        assert!(backend.object("uploads/abc").is_none());
        assert!(backend.object("meta/abc.info").is_none());
        assert!(matches!(store.object_size("abc").await, Err(MultipartError::NotFound { .. })));
    }
}
