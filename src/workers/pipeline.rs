//! Per-job state machine: download, probe, convert, derive the optional
//! artifacts, patch the catalog, reclaim the source.
//!
//! Only the catalog patch and the stages before it can abort a job. Once
//! the patch is committed the job counts as done, whatever happens to the
//! source delete or the acknowledgment afterwards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::common::keys::artifact_key;
use crate::common::scratch::ScratchSpace;
use crate::infrastructure::storage::{ObjectStore, StorageError};
use crate::media::{TranscodeError, Transcoder};
use crate::modules::resource::events::Job;
use crate::modules::resource::model::{Artifact, ArtifactKind, CatalogPatch, MediaProbe};
use crate::modules::resource::repository::{CatalogError, CatalogUpdater};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Received,
    Downloaded,
    Probed,
    Converted,
    PreviewAttempted,
    ThumbnailAttempted,
    CatalogUpdated,
    SourceReclaimed,
    Acknowledged,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Received => "received",
            JobStage::Downloaded => "downloaded",
            JobStage::Probed => "probed",
            JobStage::Converted => "converted",
            JobStage::PreviewAttempted => "preview_attempted",
            JobStage::ThumbnailAttempted => "thumbnail_attempted",
            JobStage::CatalogUpdated => "catalog_updated",
            JobStage::SourceReclaimed => "source_reclaimed",
            JobStage::Acknowledged => "acknowledged",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("scratch space: {0}")]
    Scratch(#[source] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// A fatal failure. `stage` is the state the job was trying to reach.
#[derive(Debug, Error)]
#[error("job aborted before reaching '{stage}': {source}")]
pub struct PipelineError {
    pub stage: JobStage,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    fn at(stage: JobStage) -> impl FnOnce(StageError) -> Self {
        move |source| Self { stage, source }
    }

    /// False when the catalog may hold the patch despite the error; its
    /// artifacts must then stay in place.
    pub fn allows_rollback(&self) -> bool {
        match &self.source {
            StageError::Catalog(e) => !e.may_have_committed(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedJob {
    pub converted_key: String,
    pub preview_key: Option<String>,
    pub thumbnail_key: Option<String>,
    pub patch: CatalogPatch,
    pub source_reclaimed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(CompletedJob),
    /// A redelivered message whose source is already gone. Sources are
    /// only deleted after the catalog patch commits, so an earlier
    /// delivery finished this job.
    AlreadyCompleted,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub scratch_root: PathBuf,
    /// Delete artifacts uploaded by an attempt that later aborts.
    pub rollback_on_abort: bool,
}

pub struct Pipeline {
    store: Arc<dyn ObjectStore>,
    transcoder: Arc<dyn Transcoder>,
    catalog: Arc<dyn CatalogUpdater>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        transcoder: Arc<dyn Transcoder>,
        catalog: Arc<dyn CatalogUpdater>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            transcoder,
            catalog,
            settings,
        }
    }

    /// Runs one job to completion. Scratch files are gone when this
    /// returns, on every path.
    pub async fn process(&self, job: &Job) -> Result<JobOutcome, PipelineError> {
        let scratch = ScratchSpace::allocate(&self.settings.scratch_root, job.resource_id)
            .map_err(StageError::Scratch)
            .map_err(PipelineError::at(JobStage::Downloaded))?;

        let mut uploaded = Vec::new();
        let result = self.run_stages(job, &scratch, &mut uploaded).await;
        scratch.release();

        if let Err(ref e) = result {
            if self.settings.rollback_on_abort && !uploaded.is_empty() {
                if e.allows_rollback() {
                    warn!(stage = %e.stage, artifacts = uploaded.len(), "Rolling back uploaded artifacts");
                    self.rollback(&uploaded).await;
                } else {
                    warn!(
                        stage = %e.stage,
                        artifacts = uploaded.len(),
                        "Catalog outcome unknown; keeping uploaded artifacts"
                    );
                }
            }
        }
        result
    }

    async fn run_stages(
        &self,
        job: &Job,
        scratch: &ScratchSpace,
        uploaded: &mut Vec<Artifact>,
    ) -> Result<JobOutcome, PipelineError> {
        let source = scratch.source_path(&job.original_file_name);
        match self.store.download(&job.source_key, &source).await {
            Ok(bytes) => info!(bytes, stage = %JobStage::Downloaded, "Downloaded source"),
            Err(StorageError::NotFound { .. }) if job.is_redelivery() => {
                warn!("Source object is gone; an earlier delivery already completed this job");
                return Ok(JobOutcome::AlreadyCompleted);
            }
            Err(e) => return Err(PipelineError::at(JobStage::Downloaded)(e.into())),
        }

        let probe = self
            .transcoder
            .probe(&source)
            .await
            .map_err(|e| PipelineError::at(JobStage::Probed)(e.into()))?;
        info!(
            stage = %JobStage::Probed,
            width = probe.width,
            height = probe.height,
            duration = ?probe.duration_seconds,
            frame_rate = ?probe.frame_rate,
            codec = %probe.video_codec,
            "Probed source"
        );

        let converted = self
            .convert(job, scratch, &source, uploaded)
            .await
            .map_err(PipelineError::at(JobStage::Converted))?;
        info!(stage = %JobStage::Converted, key = %converted.storage_key, "Uploaded normalized video");
        let converted_key = converted.storage_key.clone();

        let preview_key = self.preview(job, scratch, &source, &probe, uploaded).await;
        debug!(stage = %JobStage::PreviewAttempted, key = ?preview_key);

        let thumbnail_key = self.thumbnail(job, scratch, &converted.local_path, uploaded).await;
        debug!(stage = %JobStage::ThumbnailAttempted, key = ?thumbnail_key);

        let patch = CatalogPatch::for_converted(
            &converted_key,
            preview_key.as_deref(),
            thumbnail_key.as_deref(),
            &probe,
        );
        self.catalog
            .apply_patch(job.resource_id, &patch)
            .await
            .map_err(|e| PipelineError::at(JobStage::CatalogUpdated)(e.into()))?;
        info!(stage = %JobStage::CatalogUpdated, "Catalog updated");

        let source_reclaimed = match self.store.delete(&job.source_key).await {
            Ok(()) => {
                info!(stage = %JobStage::SourceReclaimed, "Deleted source object");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to delete source object; leaving it in place");
                false
            }
        };

        Ok(JobOutcome::Completed(CompletedJob {
            converted_key,
            preview_key,
            thumbnail_key,
            patch,
            source_reclaimed,
        }))
    }

    async fn convert(
        &self,
        job: &Job,
        scratch: &ScratchSpace,
        source: &Path,
        uploaded: &mut Vec<Artifact>,
    ) -> Result<Artifact, StageError> {
        let output = scratch.artifact_path(ArtifactKind::Converted);
        let output = self.transcoder.convert_to_normalized(source, &output).await?;
        Ok(self.upload(ArtifactKind::Converted, &output, &job.owner_id, uploaded).await?)
    }

    async fn preview(
        &self,
        job: &Job,
        scratch: &ScratchSpace,
        source: &Path,
        probe: &MediaProbe,
        uploaded: &mut Vec<Artifact>,
    ) -> Option<String> {
        let output = scratch.artifact_path(ArtifactKind::Preview);
        let output = match self
            .transcoder
            .generate_preview(source, &output, probe.duration_seconds)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Preview generation failed; continuing without preview");
                return None;
            }
        };

        match self.upload(ArtifactKind::Preview, &output, &job.owner_id, uploaded).await {
            Ok(artifact) => Some(artifact.storage_key),
            Err(e) => {
                warn!(error = %e, "Preview upload failed; continuing without preview");
                None
            }
        }
    }

    async fn thumbnail(
        &self,
        job: &Job,
        scratch: &ScratchSpace,
        converted: &Path,
        uploaded: &mut Vec<Artifact>,
    ) -> Option<String> {
        let output = scratch.artifact_path(ArtifactKind::Thumbnail);
        let output = match self.transcoder.extract_thumbnail(converted, &output).await {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Thumbnail extraction failed; continuing without thumbnail");
                return None;
            }
        };

        match self.upload(ArtifactKind::Thumbnail, &output, &job.owner_id, uploaded).await {
            Ok(artifact) => Some(artifact.storage_key),
            Err(e) => {
                warn!(error = %e, "Thumbnail upload failed; continuing without thumbnail");
                None
            }
        }
    }

    /// Every attempt writes under a fresh key, so a redelivered job never
    /// overwrites what an earlier attempt published.
    async fn upload(
        &self,
        kind: ArtifactKind,
        path: &Path,
        owner_id: &str,
        uploaded: &mut Vec<Artifact>,
    ) -> Result<Artifact, StorageError> {
        let content_type = kind.content_type();
        let key = artifact_key(kind, owner_id);
        let storage_key = self.store.upload(path, &key, &content_type).await?;

        let artifact = Artifact {
            kind,
            storage_key,
            local_path: path.to_path_buf(),
            content_type,
        };
        debug!(kind = kind.as_str(), key = %artifact.storage_key, content_type = %artifact.content_type, "Uploaded artifact");
        uploaded.push(artifact.clone());
        Ok(artifact)
    }

    async fn rollback(&self, artifacts: &[Artifact]) {
        for artifact in artifacts {
            if let Err(e) = self.store.delete(&artifact.storage_key).await {
                warn!(
                    kind = artifact.kind.as_str(),
                    key = %artifact.storage_key,
                    error = %e,
                    "Failed to delete artifact during rollback"
                );
            }
        }
    }
}
