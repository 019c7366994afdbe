#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use media_worker::infrastructure::queue::{DeliveryToken, JobQueue, QueueMessage};
use media_worker::infrastructure::storage::{ObjectStore, StorageError};
use media_worker::media::{TranscodeError, Transcoder};
use media_worker::modules::resource::model::{CatalogPatch, MediaProbe};
use media_worker::modules::resource::repository::{CatalogError, CatalogUpdater};
use media_worker::workers::pipeline::{Pipeline, PipelineSettings};
use media_worker::workers::transcoder::TranscoderWorker;

pub const OWNER: &str = "user-1";
pub const SOURCE_KEY: &str = "resources/user-1/holiday.mov";

pub fn job_body(resource_id: Uuid, key: &str) -> String {
    serde_json::json!({
        "resourceId": resource_id,
        "key": key,
        "userId": OWNER,
        "fileName": "holiday.mov",
        "contentType": "video/quicktime",
    })
    .to_string()
}

// ---------------------------------------------------------------- queue

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Vec<u8>>,
    in_flight: HashMap<String, (Vec<u8>, u32)>,
    receive_counts: HashMap<Vec<u8>, u32>,
    acked: Vec<String>,
}

/// Broker double. Unacknowledged messages stay in flight until
/// [`InMemoryQueue::expire_in_flight`] plays the visibility timeout.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    next_token: AtomicU64,
    pub extensions: AtomicUsize,
    pub fail_receives: AtomicUsize,
}

impl InMemoryQueue {
    pub fn push(&self, body: impl Into<Vec<u8>>) {
        self.state.lock().unwrap().pending.push_back(body.into());
    }

    pub fn expire_in_flight(&self) {
        let mut state = self.state.lock().unwrap();
        let expired: Vec<_> = state.in_flight.drain().map(|(_, (body, _))| body).collect();
        state.pending.extend(expired);
    }

    pub fn acked(&self) -> usize {
        self.state.lock().unwrap().acked.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn receive_next(&self) -> anyhow::Result<Option<QueueMessage>> {
        if self
            .fail_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("queue unavailable");
        }

        let message = {
            let mut state = self.state.lock().unwrap();
            state.pending.pop_front().map(|body| {
                let count = state.receive_counts.entry(body.clone()).or_insert(0);
                *count += 1;
                let count = *count;
                let token = format!("receipt-{}", self.next_token.fetch_add(1, Ordering::SeqCst));
                state.in_flight.insert(token.clone(), (body.clone(), count));
                QueueMessage {
                    body,
                    token: DeliveryToken::new(token),
                    receive_count: Some(count),
                }
            })
        };

        if message.is_none() {
            // stand-in for the long-poll wait
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(message)
    }

    async fn acknowledge(&self, token: &DeliveryToken) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.in_flight.remove(token.as_str()) {
            Some(_) => {
                state.acked.push(token.as_str().to_string());
                Ok(())
            }
            None => anyhow::bail!("unknown receipt handle"),
        }
    }

    async fn extend_visibility(&self, _token: &DeliveryToken, _timeout: Duration) -> anyhow::Result<()> {
        self.extensions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------- storage

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    /// Uploads whose key starts with this prefix fail.
    pub fail_upload_prefix: Mutex<Option<String>>,
    pub fail_deletes: AtomicBool,
    pub fail_downloads: AtomicBool,
}

impl MemoryStore {
    pub fn put(&self, key: &str, body: &[u8]) {
        self.objects.lock().unwrap().insert(key.to_string(), body.to_vec());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn fail_uploads_under(&self, prefix: &str) {
        *self.fail_upload_prefix.lock().unwrap() = Some(prefix.to_string());
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(StorageError::request("download", key, "connection reset"));
        }
        let body = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound { key: key.to_string() })?;
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }

    async fn upload(&self, src: &Path, key: &str, _content_type: &str) -> Result<String, StorageError> {
        let failing = self.fail_upload_prefix.lock().unwrap().clone();
        if let Some(prefix) = failing {
            if key.starts_with(&prefix) {
                return Err(StorageError::request("upload", key, "503 Slow Down"));
            }
        }
        let body = tokio::fs::read(src).await?;
        self.put(key, &body);
        Ok(key.to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::request("delete", key, "access denied"));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------- transcoder

pub struct FakeTranscoder {
    pub probe: MediaProbe,
    pub fail_probe: AtomicBool,
    pub fail_convert: AtomicBool,
    pub fail_preview: AtomicBool,
    pub fail_thumbnail: AtomicBool,
    /// Write the normalized file next to the requested path instead of at it.
    pub convert_elsewhere: AtomicBool,
    pub convert_delay: Mutex<Duration>,
    pub preview_durations: Mutex<Vec<Option<f64>>>,
    pub thumbnail_inputs: Mutex<Vec<PathBuf>>,
}

impl FakeTranscoder {
    /// A 40 second 1080p source.
    pub fn new() -> Self {
        Self {
            probe: MediaProbe {
                width: 1920,
                height: 1080,
                duration_seconds: Some(40.0),
                frame_rate: Some(30.0),
                video_codec: "hevc".to_string(),
                color_space: Some("bt709".to_string()),
                audio_codec: Some("aac".to_string()),
            },
            fail_probe: AtomicBool::new(false),
            fail_convert: AtomicBool::new(false),
            fail_preview: AtomicBool::new(false),
            fail_thumbnail: AtomicBool::new(false),
            convert_elsewhere: AtomicBool::new(false),
            convert_delay: Mutex::new(Duration::ZERO),
            preview_durations: Mutex::new(Vec::new()),
            thumbnail_inputs: Mutex::new(Vec::new()),
        }
    }
}

fn encode_failure(operation: &'static str) -> TranscodeError {
    TranscodeError::failed(operation, "ffmpeg exited with code Some(1)", None)
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn probe(&self, _path: &Path) -> Result<MediaProbe, TranscodeError> {
        if self.fail_probe.load(Ordering::SeqCst) {
            return Err(TranscodeError::NoVideoStream);
        }
        Ok(self.probe.clone())
    }

    async fn convert_to_normalized(&self, input: &Path, output: &Path) -> Result<PathBuf, TranscodeError> {
        let delay = *self.convert_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_convert.load(Ordering::SeqCst) {
            return Err(encode_failure("convert"));
        }
        let output = if self.convert_elsewhere.load(Ordering::SeqCst) {
            output.with_file_name("normalized.mp4")
        } else {
            output.to_path_buf()
        };
        let source = tokio::fs::read(input).await?;
        tokio::fs::write(&output, [b"h264:".as_slice(), source.as_slice()].concat()).await?;
        Ok(output)
    }

    async fn generate_preview(
        &self,
        _input: &Path,
        output: &Path,
        source_duration: Option<f64>,
    ) -> Result<PathBuf, TranscodeError> {
        self.preview_durations.lock().unwrap().push(source_duration);
        if self.fail_preview.load(Ordering::SeqCst) {
            return Err(encode_failure("preview"));
        }
        tokio::fs::write(output, b"preview").await?;
        Ok(output.to_path_buf())
    }

    async fn extract_thumbnail(&self, input: &Path, output: &Path) -> Result<PathBuf, TranscodeError> {
        self.thumbnail_inputs.lock().unwrap().push(input.to_path_buf());
        if self.fail_thumbnail.load(Ordering::SeqCst) {
            return Err(encode_failure("thumbnail"));
        }
        tokio::fs::write(output, b"\xff\xd8jpeg").await?;
        Ok(output.to_path_buf())
    }
}

// ---------------------------------------------------------------- catalog

#[derive(Default)]
pub struct RecordingCatalog {
    pub patches: Mutex<Vec<(Uuid, CatalogPatch)>>,
    /// Number of upcoming calls that fail.
    pub failures: AtomicUsize,
    /// Number of upcoming calls that commit but lose the reply.
    pub lost_replies: AtomicUsize,
}

impl RecordingCatalog {
    pub fn last_patch(&self) -> Option<CatalogPatch> {
        self.patches.lock().unwrap().last().map(|(_, p)| p.clone())
    }

    pub fn applied(&self) -> usize {
        self.patches.lock().unwrap().len()
    }
}

#[async_trait]
impl CatalogUpdater for RecordingCatalog {
    async fn apply_patch(&self, resource_id: Uuid, patch: &CatalogPatch) -> Result<(), CatalogError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CatalogError::Database(sqlx::Error::PoolTimedOut));
        }
        self.patches.lock().unwrap().push((resource_id, patch.clone()));
        if self
            .lost_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer");
            return Err(CatalogError::Database(sqlx::Error::Io(reset)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------- harness

pub struct Harness {
    pub queue: Arc<InMemoryQueue>,
    pub store: Arc<MemoryStore>,
    pub transcoder: Arc<FakeTranscoder>,
    pub catalog: Arc<RecordingCatalog>,
    pub scratch: TempDir,
    pub rollback_on_abort: bool,
    pub visibility_timeout: Duration,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(InMemoryQueue::default()),
            store: Arc::new(MemoryStore::default()),
            transcoder: Arc::new(FakeTranscoder::new()),
            catalog: Arc::new(RecordingCatalog::default()),
            scratch: TempDir::new().unwrap(),
            rollback_on_abort: true,
            visibility_timeout: Duration::from_secs(300),
        }
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch.path().join("scratch")
    }

    pub fn worker(&self) -> TranscoderWorker {
        let pipeline = Pipeline::new(
            self.store.clone(),
            self.transcoder.clone(),
            self.catalog.clone(),
            PipelineSettings {
                scratch_root: self.scratch_root(),
                rollback_on_abort: self.rollback_on_abort,
            },
        );
        TranscoderWorker::new(self.queue.clone(), pipeline, self.visibility_timeout)
    }

    /// Seeds the source object and enqueues its upload event.
    pub fn enqueue_upload(&self) -> Uuid {
        let resource_id = Uuid::new_v4();
        self.store.put(SOURCE_KEY, b"original bytes");
        self.queue.push(job_body(resource_id, SOURCE_KEY));
        resource_id
    }

    pub fn scratch_entries(&self) -> usize {
        match std::fs::read_dir(self.scratch_root()) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    /// Artifact keys in the store, the source excluded.
    pub fn artifact_keys(&self) -> Vec<String> {
        self.store.keys().into_iter().filter(|k| k != SOURCE_KEY).collect()
    }
}
