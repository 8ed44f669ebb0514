//! Model directories on disk: the `*.model3.json` description, the asset
//! buffers it references, and discovery of models below a directory.
//!
//! ```text
//!   "file:///models/hiyori/hiyori.model3.json"
//!          │ ModelSource::from_input
//!          ▼
//!   ModelPack::load ──▶ ModelManifest::validate
//!          │
//!          └─▶ ModelAsset::read ──▶ moc / motions / expressions as bytes
//! ```
mod asset;
mod catalog;
mod manifest;
mod pack;

pub use asset::{ModelAsset, MotionAsset, MotionKey, MotionMeta};
pub use catalog::{discover_models, is_description, DESCRIPTION_SUFFIX};
pub use manifest::{
    ExpressionFile, FileReferences, HitArea, ModelManifest, MotionFile, ParameterGroup,
    EYE_BLINK_GROUP, LIP_SYNC_GROUP,
};
pub use pack::{available_expressions, available_motions, ModelPack, PackError};

use std::path::{Path, PathBuf};

/// Where a caller says a model lives. Hosts commonly hand over `file://` URIs;
/// everything else is taken as a plain filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelSource(PathBuf);

impl ModelSource {
    pub fn from_input(input: &str) -> Self {
        let trimmed = input.trim();
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        Self(PathBuf::from(path))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn into_path(self) -> PathBuf {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_file_scheme() {
        assert_eq!(
            ModelSource::from_input("file:///sdcard/hiyori/hiyori.model3.json").path(),
            Path::new("/sdcard/hiyori/hiyori.model3.json")
        );
    }

    #[test]
    fn keeps_plain_paths() {
        assert_eq!(
            ModelSource::from_input(" models/mark.model3.json ").into_path(),
            PathBuf::from("models/mark.model3.json")
        );
    }
}
