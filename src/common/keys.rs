//! Object-store key layout. The store does not enforce it; the web
//! application and this worker agree on it by convention.

use uuid::Uuid;

use crate::modules::resource::model::ArtifactKind;

fn owner_segment(owner_id: &str) -> String {
    let cleaned: String = owner_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// A fresh key for a derived artifact. Every attempt gets a new name, so a
/// redelivered job never overwrites what an earlier attempt uploaded.
pub fn artifact_key(kind: ArtifactKind, owner_id: &str) -> String {
    let prefix = match kind {
        ArtifactKind::Converted => "resources",
        ArtifactKind::Preview => "video-previews",
        ArtifactKind::Thumbnail => "thumbnails",
    };
    format!(
        "{}/{}/{}.{}",
        prefix,
        owner_segment(owner_id),
        Uuid::new_v4().simple(),
        kind.extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_per_artifact_kind() {
        assert!(artifact_key(ArtifactKind::Converted, "user-1").starts_with("resources/user-1/"));
        assert!(artifact_key(ArtifactKind::Preview, "user-1").starts_with("video-previews/user-1/"));
        assert!(artifact_key(ArtifactKind::Thumbnail, "user-1").starts_with("thumbnails/user-1/"));
        assert!(artifact_key(ArtifactKind::Thumbnail, "user-1").ends_with(".jpg"));
    }

    #[test]
    fn keys_are_fresh_per_call() {
        assert_ne!(
            artifact_key(ArtifactKind::Converted, "u"),
            artifact_key(ArtifactKind::Converted, "u")
        );
    }

    #[test]
    fn owner_cannot_escape_prefix() {
        let key = artifact_key(ArtifactKind::Preview, "../admin");
        assert!(key.starts_with("video-previews/admin/"));
        assert!(artifact_key(ArtifactKind::Preview, "//").starts_with("video-previews/unknown/"));
    }
}
