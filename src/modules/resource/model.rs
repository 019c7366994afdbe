use std::path::PathBuf;

use serde::Serialize;

/// Container written for every normalized artifact.
pub const NORMALIZED_FORMAT: &str = "mp4";

/// Technical metadata read from the downloaded source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaProbe {
    pub width: u32,
    pub height: u32,
    pub duration_seconds: Option<f64>,
    pub frame_rate: Option<f64>,
    pub video_codec: String,
    pub color_space: Option<String>,
    pub audio_codec: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Converted,
    Preview,
    Thumbnail,
}

impl ArtifactKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Converted | ArtifactKind::Preview => "mp4",
            ArtifactKind::Thumbnail => "jpg",
        }
    }

    pub fn content_type(&self) -> String {
        mime_guess::from_ext(self.extension())
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Converted => "converted",
            ArtifactKind::Preview => "preview",
            ArtifactKind::Thumbnail => "thumbnail",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub storage_key: String,
    pub local_path: PathBuf,
    pub content_type: String,
}

/// A column value carried by a [`CatalogPatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    Text(String),
    Int(i32),
    Float(f64),
}

/// Sparse update for a resource record. `None` fields are left untouched
/// in the catalog, never written as NULL.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_color_space: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_audio_codec: Option<String>,
}

impl CatalogPatch {
    pub fn for_converted(
        converted_key: &str,
        preview_key: Option<&str>,
        thumbnail_key: Option<&str>,
        probe: &MediaProbe,
    ) -> Self {
        Self {
            file_url: Some(converted_key.to_string()),
            preview_url: preview_key.map(str::to_string),
            thumbnail_url: thumbnail_key.map(str::to_string),
            file_format: Some(NORMALIZED_FORMAT.to_string()),
            width: i32::try_from(probe.width).ok(),
            height: i32::try_from(probe.height).ok(),
            duration: probe
                .duration_seconds
                .filter(|d| d.is_finite() && *d >= 0.0)
                .map(|d| d.round() as i32),
            frame_rate: probe.frame_rate.filter(|f| f.is_finite() && *f > 0.0),
            video_encoding: Some(probe.video_codec.clone()),
            video_color_space: probe.color_space.clone(),
            video_audio_codec: probe.audio_codec.clone(),
        }
    }

    /// Present fields as `(column, value)` pairs in a stable order.
    pub fn columns(&self) -> Vec<(&'static str, PatchValue)> {
        let mut columns = Vec::new();
        let text = |v: &Option<String>| v.clone().map(PatchValue::Text);

        let entries = [
            ("file_url", text(&self.file_url)),
            ("preview_url", text(&self.preview_url)),
            ("thumbnail_url", text(&self.thumbnail_url)),
            ("file_format", text(&self.file_format)),
            ("width", self.width.map(PatchValue::Int)),
            ("height", self.height.map(PatchValue::Int)),
            ("duration", self.duration.map(PatchValue::Int)),
            ("frame_rate", self.frame_rate.map(PatchValue::Float)),
            ("video_encoding", text(&self.video_encoding)),
            ("video_color_space", text(&self.video_color_space)),
            ("video_audio_codec", text(&self.video_audio_codec)),
        ];

        for (column, value) in entries {
            if let Some(value) = value {
                columns.push((column, value));
            }
        }
        columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns().is_empty()
    }
}
