//! Media transcoding behind the [`Transcoder`] trait. The ffmpeg driver
//! is the only production implementation; tests substitute their own.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::modules::resource::model::MediaProbe;

pub mod error;
pub mod ffmpeg;
pub mod probe;

pub use error::TranscodeError;
pub use ffmpeg::{FfmpegTranscoder, TranscoderConfig};

/// Longest preview clip, in seconds.
pub const PREVIEW_MAX_SECS: f64 = 30.0;

/// `min(D/2, 30)`, or the cap when the source duration is unknown.
pub fn preview_duration_secs(source_duration: Option<f64>) -> f64 {
    match source_duration {
        Some(d) if d.is_finite() && d > 0.0 => (d / 2.0).min(PREVIEW_MAX_SECS),
        _ => PREVIEW_MAX_SECS,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Convert,
    Preview,
    Thumbnail,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Convert => "convert",
            Operation::Preview => "preview",
            Operation::Thumbnail => "thumbnail",
        }
    }
}

/// Periodic report from a running ffmpeg invocation.
#[derive(Debug, Clone)]
pub struct TranscodeProgress {
    pub operation: Operation,
    pub time_secs: f64,
    pub duration_secs: Option<f64>,
    pub speed: Option<String>,
}

impl TranscodeProgress {
    pub fn percent(&self) -> Option<f32> {
        self.duration_secs
            .filter(|d| *d > 0.0)
            .map(|d| (self.time_secs / d * 100.0).clamp(0.0, 100.0) as f32)
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaProbe, TranscodeError>;

    /// H.264 High / yuv420p / MP4 faststart, video only.
    async fn convert_to_normalized(&self, input: &Path, output: &Path) -> Result<PathBuf, TranscodeError>;

    async fn generate_preview(
        &self,
        input: &Path,
        output: &Path,
        source_duration: Option<f64>,
    ) -> Result<PathBuf, TranscodeError>;

    /// One JPEG frame from the middle of `input`.
    async fn extract_thumbnail(&self, input: &Path, output: &Path) -> Result<PathBuf, TranscodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_is_half_of_short_sources() {
        assert_eq!(preview_duration_secs(Some(40.0)), 20.0);
        assert_eq!(preview_duration_secs(Some(7.0)), 3.5);
    }

    #[test]
    fn preview_is_capped() {
        assert_eq!(preview_duration_secs(Some(100.0)), 30.0);
        assert_eq!(preview_duration_secs(Some(3600.0)), 30.0);
    }

    #[test]
    fn preview_defaults_to_cap_when_duration_unknown() {
        assert_eq!(preview_duration_secs(None), 30.0);
        assert_eq!(preview_duration_secs(Some(0.0)), 30.0);
        assert_eq!(preview_duration_secs(Some(-5.0)), 30.0);
        assert_eq!(preview_duration_secs(Some(f64::NAN)), 30.0);
    }

    #[test]
    fn progress_percent_is_clamped() {
        let progress = TranscodeProgress {
            operation: Operation::Convert,
            time_secs: 50.0,
            duration_secs: Some(40.0),
            speed: None,
        };
        assert_eq!(progress.percent(), Some(100.0));

        let unknown = TranscodeProgress {
            duration_secs: None,
            ..progress
        };
        assert_eq!(unknown.percent(), None);
    }
}
