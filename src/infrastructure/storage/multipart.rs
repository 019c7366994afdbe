use std::path::Path;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use super::StorageError;
use super::s3::StorageService;

// S3 rejects non-final parts under 5 MiB.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

pub struct MultipartUploader<'a> {
    storage: &'a StorageService,
    key: String,
    upload_id: String,
    parts: Vec<aws_sdk_s3::types::CompletedPart>,
    part_number: i32,
    buffer: BytesMut,
}

impl<'a> MultipartUploader<'a> {
    pub async fn new(storage: &'a StorageService, key: String, content_type: &str) -> Result<Self, StorageError> {
        let upload_id = storage.create_multipart_upload(&key, content_type).await?;

        Ok(Self {
            storage,
            key,
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            buffer: BytesMut::with_capacity(PART_SIZE),
        })
    }

    /// Streams the whole file and completes the upload. Any failure aborts
    /// the upload so no parts are left billed against the bucket.
    pub async fn upload_file(mut self, src: &Path) -> Result<(), StorageError> {
        let file = tokio::fs::File::open(src).await?;
        let mut stream = ReaderStream::with_capacity(file, 64 * 1024);

        while let Some(chunk) = stream.next().await {
            let result = match chunk {
                Ok(chunk) => self.write_chunk(chunk).await,
                Err(e) => Err(StorageError::Io(e)),
            };
            if let Err(e) = result {
                error!(key = %self.key, error = %e, "Multipart upload interrupted");
                self.abort().await;
                return Err(e);
            }
        }

        if let Err(e) = self.flush_part().await {
            self.abort().await;
            return Err(e);
        }
        self.finish().await
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), StorageError> {
        self.buffer.extend_from_slice(&chunk);

        if self.buffer.len() >= PART_SIZE {
            self.flush_part().await?;
        }

        Ok(())
    }

    async fn flush_part(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let body = self.buffer.split().freeze();
        let part = self
            .storage
            .upload_part(&self.key, &self.upload_id, self.part_number, body)
            .await?;

        self.parts.push(part);
        self.part_number += 1;

        Ok(())
    }

    async fn finish(self) -> Result<(), StorageError> {
        let result = self
            .storage
            .complete_multipart_upload(&self.key, &self.upload_id, self.parts.clone())
            .await;
        if result.is_err() {
            self.abort().await;
        }
        result
    }

    async fn abort(&self) {
        if let Err(e) = self.storage.abort_multipart_upload(&self.key, &self.upload_id).await {
            warn!(key = %self.key, error = %e, "Failed to abort multipart upload");
        }
    }
}
