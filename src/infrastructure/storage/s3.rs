use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{Client, config::BehaviorVersion, config::Credentials, config::Region};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::multipart::MultipartUploader;
use super::{ObjectStore, StorageError};

/// Files at or above this size go through multipart upload.
pub const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct StorageService {
    pub client: Client,
    pub bucket: String,
    http: reqwest::Client,
    signed_url_ttl: Duration,
}

pub struct StorageSettings<'a> {
    pub endpoint: Option<&'a str>,
    pub bucket: &'a str,
    pub region: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub signed_url_ttl: Duration,
}

impl StorageService {
    pub fn new(settings: StorageSettings<'_>) -> Self {
        let credentials = Credentials::new(settings.access_key, settings.secret_key, None, None, "static");

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.to_string()))
            .credentials_provider(credentials);
        if let Some(endpoint) = settings.endpoint {
            // Path-style addressing keeps MinIO and other S3-compatible
            // stores working without wildcard DNS.
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        info!(bucket = settings.bucket, "Configured S3 object store");

        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.to_string(),
            http: reqwest::Client::new(),
            signed_url_ttl: settings.signed_url_ttl,
        }
    }

    async fn signed_read_url(&self, key: &str) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(self.signed_url_ttl)
            .map_err(|e| StorageError::request("presign", key, e))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::request("presign", key, e))?;

        Ok(request.uri().to_string())
    }

    async fn put_object(&self, src: &Path, key: &str, content_type: &str) -> Result<(), StorageError> {
        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| StorageError::request("upload", key, e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::request("upload", key, e))?;
        Ok(())
    }

    pub async fn create_multipart_upload(&self, key: &str, content_type: &str) -> Result<String, StorageError> {
        let result = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::request("create multipart upload", key, e))?;

        result
            .upload_id
            .ok_or_else(|| StorageError::request("create multipart upload", key, "no upload id returned"))
    }

    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: bytes::Bytes,
    ) -> Result<aws_sdk_s3::types::CompletedPart, StorageError> {
        let result = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::request("upload part", key, e))?;

        let e_tag = result
            .e_tag
            .ok_or_else(|| StorageError::request("upload part", key, "no ETag returned"))?;

        Ok(aws_sdk_s3::types::CompletedPart::builder()
            .e_tag(e_tag)
            .part_number(part_number)
            .build())
    }

    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<aws_sdk_s3::types::CompletedPart>,
    ) -> Result<(), StorageError> {
        let completed_multipart_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await
            .map_err(|e| StorageError::request("complete multipart upload", key, e))?;

        Ok(())
    }

    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| StorageError::request("abort multipart upload", key, e))?;

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        let start = Instant::now();
        let url = self.signed_read_url(key).await?;

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| StorageError::request("download", key, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound { key: key.to_string() });
        }
        let response = response
            .error_for_status()
            .map_err(|e| StorageError::request("download", key, e))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StorageError::request("download", key, e))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(
            key,
            bytes = written,
            duration_ms = start.elapsed().as_millis() as u64,
            "Downloaded object"
        );
        Ok(written)
    }

    async fn upload(&self, src: &Path, key: &str, content_type: &str) -> Result<String, StorageError> {
        let start = Instant::now();
        let size = tokio::fs::metadata(src).await?.len();

        if size >= MULTIPART_THRESHOLD {
            MultipartUploader::new(self, key.to_string(), content_type)
                .await?
                .upload_file(src)
                .await?;
        } else {
            self.put_object(src, key, content_type).await?;
        }

        debug!(
            key,
            bytes = size,
            content_type,
            duration_ms = start.elapsed().as_millis() as u64,
            "Uploaded object"
        );
        Ok(key.to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        // S3 reports success for keys that are already gone.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::request("delete", key, e))?;

        debug!(key, "Deleted object");
        Ok(())
    }
}
