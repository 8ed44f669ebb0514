//! Wraps one model directory so the stage can resolve every asset a model
//! description references without re-deriving paths at each call site.
//!
//! Types:
//!
//! - `PackError` classifies description parsing, validation and I/O failures.
//! - `ModelPack` stores the description path, its directory (the model's home
//!   directory) and the parsed `ModelManifest`.
//!
//! Functions:
//!
//! - `ModelPack::load` reads and validates a `*.model3.json` file.
//! - `ModelPack::texture_paths`, `motion_path`, `expression_path` resolve
//!   references against the home directory.
//! - `available_motions` / `available_expressions` answer catalog queries
//!   for a model without loading any asset bytes.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::manifest::{HitArea, ModelManifest, MotionFile};

#[derive(Debug, Error)]
pub enum PackError {
    #[error("model description not found at {0}")]
    ManifestMissing(PathBuf),

    #[error("failed to parse model description: {0}")]
    ManifestParse(#[from] serde_json::Error),

    #[error("model description validation failed: {0:?}")]
    ManifestValidation(Vec<String>),

    #[error("failed to read asset {path}: {source}")]
    AssetRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ModelPack {
    manifest_path: PathBuf,
    root: PathBuf,
    manifest: ModelManifest,
}

impl ModelPack {
    pub fn load(manifest_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let manifest_path = manifest_path.as_ref().to_path_buf();
        if !manifest_path.is_file() {
            return Err(PackError::ManifestMissing(manifest_path));
        }

        let raw = fs::read_to_string(&manifest_path)?;
        let manifest: ModelManifest = serde_json::from_str(&raw)?;
        let issues = manifest.validate();
        if !issues.is_empty() {
            return Err(PackError::ManifestValidation(issues));
        }

        let root = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(Self {
            manifest_path,
            root,
            manifest,
        })
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Directory every reference in the description is relative to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &ModelManifest {
        &self.manifest
    }

    pub fn moc_path(&self) -> Option<PathBuf> {
        self.manifest
            .file_references
            .moc
            .as_ref()
            .map(|moc| self.root.join(moc))
    }

    /// Texture files keyed by slot index. Slots whose reference is empty are
    /// skipped and stay unbound.
    pub fn texture_paths(&self) -> Vec<(usize, PathBuf)> {
        self.manifest
            .texture_files()
            .iter()
            .enumerate()
            .filter(|(_, path)| !path.as_os_str().is_empty())
            .map(|(slot, path)| (slot, self.root.join(path)))
            .collect()
    }

    pub fn motion_count(&self, group: &str) -> usize {
        self.manifest
            .file_references
            .motions
            .get(group)
            .map_or(0, Vec::len)
    }

    pub fn motion(&self, group: &str, index: usize) -> Option<&MotionFile> {
        self.manifest.file_references.motions.get(group)?.get(index)
    }

    pub fn motion_path(&self, group: &str, index: usize) -> Option<PathBuf> {
        self.motion(group, index)
            .map(|motion| self.root.join(&motion.file))
    }

    pub fn expression_ids(&self) -> impl Iterator<Item = &str> {
        self.manifest
            .file_references
            .expressions
            .iter()
            .map(|expression| expression.name.as_str())
    }

    pub fn expression_path(&self, id: &str) -> Option<PathBuf> {
        self.manifest
            .file_references
            .expressions
            .iter()
            .find(|expression| expression.name == id)
            .map(|expression| self.root.join(&expression.file))
    }

    pub fn hit_area(&self, name: &str) -> Option<&HitArea> {
        self.manifest.hit_area(name)
    }

    pub fn available_motions(&self) -> BTreeMap<String, usize> {
        self.manifest
            .file_references
            .motions
            .iter()
            .map(|(group, motions)| (group.clone(), motions.len()))
            .collect()
    }

    pub fn available_expressions(&self) -> Vec<String> {
        self.expression_ids().map(str::to_string).collect()
    }
}

pub fn available_motions(
    manifest_path: impl AsRef<Path>,
) -> Result<BTreeMap<String, usize>, PackError> {
    ModelPack::load(manifest_path).map(|pack| pack.available_motions())
}

pub fn available_expressions(manifest_path: impl AsRef<Path>) -> Result<Vec<String>, PackError> {
    ModelPack::load(manifest_path).map(|pack| pack.available_expressions())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_model(dir: &Path, description: &str) -> PathBuf {
        let path = dir.join("demo.model3.json");
        fs::write(&path, description).expect("write description");
        path
    }

    const DEMO: &str = r#"{
        "Version": 3,
        "FileReferences": {
            "Moc": "demo.moc3",
            "Textures": ["textures/a.png", "", "textures/c.png"],
            "Expressions": [
                {"Name": "smile", "File": "exp/smile.exp3.json"},
                {"Name": "angry", "File": "exp/angry.exp3.json"}
            ],
            "Motions": {
                "Idle": [
                    {"File": "motion/idle0.motion3.json"},
                    {"File": "motion/idle1.motion3.json"}
                ],
                "TapBody": [{"File": "motion/tap.motion3.json"}]
            }
        },
        "HitAreas": [{"Id": "HitAreaHead", "Name": "Head"}]
    }"#;

    #[test]
    fn loads_description_and_resolves_paths() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_model(temp.path(), DEMO);

        let pack = ModelPack::load(&path).expect("load pack");
        assert_eq!(pack.root(), temp.path());
        assert_eq!(pack.moc_path(), Some(temp.path().join("demo.moc3")));
        assert_eq!(
            pack.texture_paths(),
            vec![
                (0, temp.path().join("textures/a.png")),
                (2, temp.path().join("textures/c.png")),
            ]
        );
        assert_eq!(pack.motion_count("Idle"), 2);
        assert_eq!(pack.motion_count("Missing"), 0);
        assert_eq!(
            pack.motion_path("TapBody", 0),
            Some(temp.path().join("motion/tap.motion3.json"))
        );
        assert!(pack.motion_path("TapBody", 1).is_none());
        assert_eq!(
            pack.expression_path("angry"),
            Some(temp.path().join("exp/angry.exp3.json"))
        );
        assert_eq!(pack.hit_area("Head").map(|area| area.id.as_str()), Some("HitAreaHead"));
    }

    #[test]
    fn catalog_queries_list_groups_and_expressions() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_model(temp.path(), DEMO);

        let motions = available_motions(&path).expect("motions");
        assert_eq!(motions.get("Idle"), Some(&2));
        assert_eq!(motions.get("TapBody"), Some(&1));
        assert_eq!(
            available_expressions(&path).expect("expressions"),
            vec!["smile".to_string(), "angry".to_string()]
        );
    }

    #[test]
    fn missing_description_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let err = ModelPack::load(temp.path().join("nope.model3.json")).unwrap_err();
        assert!(matches!(err, PackError::ManifestMissing(_)));
    }

    #[test]
    fn malformed_description_is_a_parse_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_model(temp.path(), "{ not json");
        let err = ModelPack::load(&path).unwrap_err();
        assert!(matches!(err, PackError::ManifestParse(_)));
    }

    #[test]
    fn invalid_description_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_model(temp.path(), r#"{"FileReferences": {}}"#);
        let err = ModelPack::load(&path).unwrap_err();
        assert!(matches!(err, PackError::ManifestValidation(issues) if !issues.is_empty()));
    }
}
