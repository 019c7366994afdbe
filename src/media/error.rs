//! Error types for the media module.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("ffmpeg not found at path: {path}")]
    FfmpegNotFound { path: PathBuf },

    #[error("ffprobe not found at path: {path}")]
    FfprobeNotFound { path: PathBuf },

    #[error("input file not found: {path}")]
    InputNotFound { path: PathBuf },

    /// ffprobe could not read the container at all.
    #[error("failed to probe media file: {reason}")]
    ProbeFailed { reason: String },

    #[error("media file has no video stream")]
    NoVideoStream,

    #[error("failed to parse ffprobe output: {reason}")]
    ParseError { reason: String },

    #[error("{operation} failed: {reason}")]
    Failed {
        operation: &'static str,
        reason: String,
        stderr: Option<String>,
    },

    #[error("{operation} timed out after {timeout_secs} seconds")]
    Timeout {
        operation: &'static str,
        timeout_secs: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    pub fn failed(operation: &'static str, reason: impl Into<String>, stderr: Option<String>) -> Self {
        Self::Failed {
            operation,
            reason: reason.into(),
            stderr,
        }
    }

    pub fn probe_failed(reason: impl Into<String>) -> Self {
        Self::ProbeFailed { reason: reason.into() }
    }
}
