use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Region, RequestChecksumCalculation};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{
    ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart as SdkCompletedPart, Delete,
    ObjectIdentifier,
};
use aws_sdk_s3::Client;
use futures::StreamExt;
use tokio_util::io::ReaderStream;

use super::{
    BackendResult, CompleteMultipartUploadRequest, CompleteMultipartUploadResponse,
    CreateMultipartUploadRequest, GetObjectResponse, ObjectBackend, ObjectBody, ObjectHead,
    PutObjectRequest, PutObjectResponse, UploadPartCopyRequest, UploadPartRequest,
};
use crate::{BackendError, BackendErrorKind, ByteRange, MultipartError, MultipartResult, Operation};

/// S3 allows at most this many keys in one DeleteObjects request
const DELETE_BATCH: usize = 1000;

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for MinIO, Ceph, OSS and friends
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    /// Static credentials. When absent the default AWS provider chain is used
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl S3Config {
    pub fn new<B: Into<String>, R: Into<String>>(bucket: B, region: R) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
        }
    }

    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_path_style(mut self) -> Self {
        self.force_path_style = true;
        self
    }

    pub fn with_credentials<A: Into<String>, S: Into<String>>(mut self, access_key_id: A, secret_access_key: S) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    /// Read the configuration from `DOG_MULTIPART_S3_*` and the standard AWS variables
    pub fn from_env() -> MultipartResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> MultipartResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bucket = lookup("DOG_MULTIPART_S3_BUCKET")
            .filter(|b| !b.is_empty())
            .ok_or_else(|| MultipartError::invalid_config("DOG_MULTIPART_S3_BUCKET is not set"))?;
        let region = lookup("DOG_MULTIPART_S3_REGION")
            .or_else(|| lookup("AWS_REGION"))
            .unwrap_or_else(|| "us-east-1".to_string());
        let force_path_style = match lookup("DOG_MULTIPART_S3_FORCE_PATH_STYLE").as_deref() {
            None | Some("") | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => {
                return Err(MultipartError::invalid_config(format!(
                    "DOG_MULTIPART_S3_FORCE_PATH_STYLE must be true or false, got {}",
                    other
                )))
            }
        };

        Ok(Self {
            bucket,
            region,
            endpoint: lookup("DOG_MULTIPART_S3_ENDPOINT").filter(|e| !e.is_empty()),
            force_path_style,
            access_key_id: lookup("AWS_ACCESS_KEY_ID"),
            secret_access_key: lookup("AWS_SECRET_ACCESS_KEY"),
        })
    }
}

/// [`ObjectBackend`] on top of the AWS SDK
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key), Some(secret)) = (config.access_key_id, config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(key, secret, None, None, "dog-multipart"));
        }
        let shared = loader.load().await;

        Self {
            client: Client::from_conf(client_config(&shared, config.force_path_style)),
            bucket: config.bucket,
        }
    }

    /// Wrap an already configured client
    pub fn from_client<S: Into<String>>(client: Client, bucket: S) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn sdk_body(operation: Operation, body: ObjectBody) -> BackendResult<SdkByteStream> {
        match body {
            ObjectBody::Bytes(bytes) => Ok(SdkByteStream::from(bytes)),
            ObjectBody::File { path, .. } => SdkByteStream::from_path(&path)
                .await
                .map_err(|e| BackendError::permanent(operation, format!("cannot read {}: {}", path.display(), e))),
        }
    }
}

/// Checksums are only those the pipeline sets on each request, so the SDK
/// must not add its own CRC headers
fn client_config(shared: &aws_config::SdkConfig, force_path_style: bool) -> aws_sdk_s3::Config {
    let mut builder = S3ConfigBuilder::from(shared)
        .request_checksum_calculation(RequestChecksumCalculation::WhenRequired);
    if force_path_style {
        builder = builder.force_path_style(true);
    }
    builder.build()
}

fn to_hash_map(metadata: BTreeMap<String, String>) -> Option<HashMap<String, String>> {
    if metadata.is_empty() {
        return None;
    }
    Some(metadata.into_iter().collect())
}

/// Sort an SDK failure into transient, permanent or not-found
fn classify<E>(operation: Operation, err: SdkError<E, HttpResponse>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    let kind = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            BackendErrorKind::Transient
        }
        SdkError::ConstructionFailure(_) => BackendErrorKind::Permanent,
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            match (status, err.code()) {
                (404, _) | (_, Some("NoSuchKey")) | (_, Some("NoSuchUpload")) | (_, Some("NotFound")) => {
                    BackendErrorKind::NotFound
                }
                (429, _) | (500..=599, _) => BackendErrorKind::Transient,
                (_, Some("SlowDown")) | (_, Some("RequestTimeout")) | (_, Some("InternalError")) => {
                    BackendErrorKind::Transient
                }
                _ => BackendErrorKind::Permanent,
            }
        }
        _ => BackendErrorKind::Transient,
    };
    BackendError::new(kind, operation, message)
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn put_object(&self, request: PutObjectRequest) -> BackendResult<PutObjectResponse> {
        let op = Operation::PutObject;
        let length = request.body.len();
        let body = Self::sdk_body(op, request.body).await?;
        let out = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&request.key)
            .content_length(length as i64)
            .body(body)
            .set_content_type(request.content_type)
            .set_metadata(to_hash_map(request.metadata))
            .send()
            .await
            .map_err(|e| classify(op, e))?;
        Ok(PutObjectResponse {
            etag: out.e_tag().map(str::to_string),
        })
    }

    async fn get_object(&self, key: &str, range: Option<ByteRange>) -> BackendResult<GetObjectResponse> {
        let op = Operation::GetObject;
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range.map(|r| r.to_header()))
            .send()
            .await
            .map_err(|e| classify(op, e))?;

        let size_bytes = out.content_length().unwrap_or_default().max(0) as u64;
        let content_type = out.content_type().map(str::to_string);
        let etag = out.e_tag().map(str::to_string);
        let stream = ReaderStream::new(out.body.into_async_read()).boxed();
        Ok(GetObjectResponse {
            stream,
            size_bytes,
            content_type,
            etag,
        })
    }

    async fn head_object(&self, key: &str) -> BackendResult<ObjectHead> {
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(Operation::HeadObject, e))?;
        Ok(ObjectHead {
            size_bytes: out.content_length().unwrap_or_default().max(0) as u64,
            content_type: out.content_type().map(str::to_string),
            etag: out.e_tag().map(str::to_string),
            metadata: out
                .metadata()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        })
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(Operation::DeleteObject, e))?;
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> BackendResult<()> {
        let op = Operation::DeleteObjects;
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BackendError::permanent(op, e.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| BackendError::permanent(op, e.to_string()))?;

            let out = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| classify(op, e))?;
            if let Some(failed) = out.errors().first() {
                return Err(BackendError::permanent(
                    op,
                    format!(
                        "could not delete {}: {}",
                        failed.key().unwrap_or_default(),
                        failed.message().unwrap_or_default()
                    ),
                ));
            }
        }
        Ok(())
    }

    async fn create_multipart_upload(&self, request: CreateMultipartUploadRequest) -> BackendResult<String> {
        let op = Operation::CreateMultipartUpload;
        let out = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&request.key)
            .set_content_type(request.content_type)
            .set_metadata(to_hash_map(request.metadata))
            .set_checksum_algorithm(request.checksum_sha256.then_some(ChecksumAlgorithm::Sha256))
            .send()
            .await
            .map_err(|e| classify(op, e))?;
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| BackendError::permanent(op, "response carried no upload id"))
    }

    async fn upload_part(&self, request: UploadPartRequest) -> BackendResult<String> {
        let op = Operation::UploadPart;
        let length = request.body.len();
        let body = Self::sdk_body(op, request.body).await?;
        let out = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .part_number(request.part_number)
            .content_length(length as i64)
            .set_content_md5(request.digests.content_md5)
            .set_checksum_sha256(request.digests.checksum_sha256)
            .body(body)
            .send()
            .await
            .map_err(|e| classify(op, e))?;
        out.e_tag()
            .map(str::to_string)
            .ok_or_else(|| BackendError::transient(op, "response carried no etag"))
    }

    async fn upload_part_copy(&self, request: UploadPartCopyRequest) -> BackendResult<String> {
        let op = Operation::UploadPartCopy;
        let out = self
            .client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .part_number(request.part_number)
            .copy_source(format!("{}/{}", self.bucket, request.source_key))
            .set_copy_source_range(request.source_range.map(|r| r.to_header()))
            .send()
            .await
            .map_err(|e| classify(op, e))?;
        out.copy_part_result()
            .and_then(|r| r.e_tag())
            .map(str::to_string)
            .ok_or_else(|| BackendError::transient(op, "response carried no etag"))
    }

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartUploadRequest,
    ) -> BackendResult<CompleteMultipartUploadResponse> {
        let parts = request
            .parts
            .into_iter()
            .map(|part| {
                SdkCompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(part.etag)
                    .set_checksum_sha256(part.checksum_sha256)
                    .build()
            })
            .collect();
        let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();

        let out = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify(Operation::CompleteMultipartUpload, e))?;
        Ok(CompleteMultipartUploadResponse {
            etag: out.e_tag().map(str::to_string),
        })
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify(Operation::AbortMultipartUpload, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn client_leaves_checksums_to_the_pipeline() {
        let shared = aws_config::SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        let config = client_config(&shared, true);
        assert_eq!(
            config.request_checksum_calculation(),
            Some(&RequestChecksumCalculation::WhenRequired)
        );
    }

    #[test]
    fn from_env_requires_bucket() {
        let err = S3Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("DOG_MULTIPART_S3_BUCKET"));
    }

    #[test]
    fn from_env_reads_endpoint_and_path_style() {
        let config = S3Config::from_lookup(lookup(&[
            ("DOG_MULTIPART_S3_BUCKET", "uploads"),
            ("AWS_REGION", "eu-central-1"),
            ("DOG_MULTIPART_S3_ENDPOINT", "http://localhost:9000"),
            ("DOG_MULTIPART_S3_FORCE_PATH_STYLE", "true"),
        ]))
        .unwrap();

        assert_eq!(config.bucket, "uploads");
        assert_eq!(config.region, "eu-central-1");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.force_path_style);
        assert!(config.access_key_id.is_none());
    }

    #[test]
    fn from_env_rejects_bad_path_style_flag() {
        let err = S3Config::from_lookup(lookup(&[
            ("DOG_MULTIPART_S3_BUCKET", "uploads"),
            ("DOG_MULTIPART_S3_FORCE_PATH_STYLE", "sometimes"),
        ]))
        .unwrap_err();
        assert!(matches!(err, MultipartError::InvalidConfig { .. }));
    }
}
