//! Byte buffers for everything a model needs before the engine can construct
//! it. Reading happens once per load; the engine receives the buffers and
//! never touches the filesystem itself.
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::manifest::{EYE_BLINK_GROUP, LIP_SYNC_GROUP};
use crate::pack::{ModelPack, PackError};

/// Identifies one motion clip inside a model: `group` plus position in that
/// group's list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MotionKey {
    pub group: String,
    pub index: usize,
}

impl MotionKey {
    pub fn new(group: impl Into<String>, index: usize) -> Self {
        Self {
            group: group.into(),
            index,
        }
    }
}

impl fmt::Display for MotionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.group, self.index)
    }
}

#[derive(Debug, Clone)]
pub struct MotionAsset {
    pub bytes: Vec<u8>,
    pub fade_in: Option<f32>,
    pub fade_out: Option<f32>,
}

/// Playback metadata from the `Meta` block of a motion file.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MotionMeta {
    pub duration: f32,
    #[serde(default)]
    pub fps: Option<f32>,
    #[serde(default, rename = "Loop")]
    pub looping: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MotionDocument {
    meta: MotionMeta,
}

impl MotionAsset {
    pub fn meta(&self) -> Option<MotionMeta> {
        serde_json::from_slice::<MotionDocument>(&self.bytes)
            .ok()
            .map(|doc| doc.meta)
    }
}

#[derive(Debug, Clone)]
pub struct ModelAsset {
    pub root: PathBuf,
    pub manifest_path: PathBuf,
    pub moc: Vec<u8>,
    pub physics: Option<Vec<u8>>,
    pub pose: Option<Vec<u8>>,
    pub motions: BTreeMap<MotionKey, MotionAsset>,
    pub expressions: BTreeMap<String, Vec<u8>>,
    pub eye_blink_ids: Vec<String>,
    pub lip_sync_ids: Vec<String>,
    pub hit_areas: BTreeMap<String, String>,
    pub layout: BTreeMap<String, f32>,
}

impl ModelAsset {
    /// Reads every buffer the description references. A missing moc, physics
    /// or pose file fails the load; unreadable motions and expressions are
    /// skipped with a warning so one bad clip does not hide the model.
    pub fn read(pack: &ModelPack) -> Result<Self, PackError> {
        let manifest = pack.manifest();
        let moc_path = pack
            .moc_path()
            .ok_or_else(|| PackError::ManifestValidation(vec!["missing moc reference".into()]))?;
        let moc = read_bytes(&moc_path)?;

        let refs = &manifest.file_references;
        let physics = refs
            .physics
            .as_ref()
            .map(|path| read_bytes(&pack.root().join(path)))
            .transpose()?;
        let pose = refs
            .pose
            .as_ref()
            .map(|path| read_bytes(&pack.root().join(path)))
            .transpose()?;

        let mut motions = BTreeMap::new();
        for (group, entries) in &refs.motions {
            for (index, entry) in entries.iter().enumerate() {
                let key = MotionKey::new(group.clone(), index);
                let path = pack.root().join(&entry.file);
                match read_bytes(&path) {
                    Ok(bytes) => {
                        motions.insert(
                            key,
                            MotionAsset {
                                bytes,
                                fade_in: entry.fade_in_time,
                                fade_out: entry.fade_out_time,
                            },
                        );
                    }
                    Err(err) => warn!(motion = %key, error = %err, "skipping unreadable motion"),
                }
            }
        }

        let mut expressions = BTreeMap::new();
        for expression in &refs.expressions {
            let path = pack.root().join(&expression.file);
            match read_bytes(&path) {
                Ok(bytes) => {
                    expressions.insert(expression.name.clone(), bytes);
                }
                Err(err) => warn!(
                    expression = %expression.name,
                    error = %err,
                    "skipping unreadable expression"
                ),
            }
        }

        Ok(Self {
            root: pack.root().to_path_buf(),
            manifest_path: pack.manifest_path().to_path_buf(),
            moc,
            physics,
            pose,
            motions,
            expressions,
            eye_blink_ids: manifest.group_ids(EYE_BLINK_GROUP),
            lip_sync_ids: manifest.group_ids(LIP_SYNC_GROUP),
            hit_areas: manifest
                .hit_areas
                .iter()
                .map(|area| (area.name.clone(), area.id.clone()))
                .collect(),
            layout: manifest.layout.clone(),
        })
    }

    pub fn motion(&self, group: &str, index: usize) -> Option<&MotionAsset> {
        self.motions.get(&MotionKey::new(group, index))
    }
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, PackError> {
    fs::read(path).map_err(|source| PackError::AssetRead {
        path: path.to_path_buf(),
        source,
    })
}
