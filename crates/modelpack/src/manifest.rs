//! Schema of the `*.model3.json` model description that sits at the root of
//! every model directory. Only the references the embedding needs are typed;
//! unknown keys are ignored so newer exporter output still loads.
//!
//! Types:
//!
//! - `ModelManifest` is the top-level document: file references, parameter
//!   groups, hit areas and layout hints.
//! - `FileReferences` lists the moc, textures, physics, pose, expressions and
//!   motions relative to the model directory.
//! - `MotionFile` / `ExpressionFile` describe one motion clip or expression.
//! - `ParameterGroup` and `HitArea` carry engine ids used for eye blink, lip
//!   sync and touch hit testing.
//!
//! Functions:
//!
//! - `ModelManifest::validate` returns human-readable issues so the pack loader
//!   can reject a broken description before any asset is read.
//! - `ModelManifest::texture_files` falls back to the legacy lowercase
//!   `textures` array used by older exporters.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const EYE_BLINK_GROUP: &str = "EyeBlink";
pub const LIP_SYNC_GROUP: &str = "LipSync";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ModelManifest {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub file_references: FileReferences,
    #[serde(default)]
    pub groups: Vec<ParameterGroup>,
    #[serde(default)]
    pub hit_areas: Vec<HitArea>,
    #[serde(default)]
    pub layout: BTreeMap<String, f32>,
    #[serde(default, rename = "textures", skip_serializing_if = "Vec::is_empty")]
    pub legacy_textures: Vec<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct FileReferences {
    #[serde(default)]
    pub moc: Option<PathBuf>,
    #[serde(default)]
    pub textures: Vec<PathBuf>,
    #[serde(default)]
    pub physics: Option<PathBuf>,
    #[serde(default)]
    pub pose: Option<PathBuf>,
    #[serde(default)]
    pub display_info: Option<PathBuf>,
    #[serde(default)]
    pub user_data: Option<PathBuf>,
    #[serde(default)]
    pub expressions: Vec<ExpressionFile>,
    #[serde(default)]
    pub motions: BTreeMap<String, Vec<MotionFile>>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct MotionFile {
    pub file: PathBuf,
    #[serde(default)]
    pub fade_in_time: Option<f32>,
    #[serde(default)]
    pub fade_out_time: Option<f32>,
    #[serde(default)]
    pub sound: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ExpressionFile {
    pub name: String,
    pub file: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ParameterGroup {
    #[serde(default)]
    pub target: String,
    pub name: String,
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct HitArea {
    pub id: String,
    pub name: String,
}

impl ModelManifest {
    pub fn texture_files(&self) -> &[PathBuf] {
        if self.file_references.textures.is_empty() {
            &self.legacy_textures
        } else {
            &self.file_references.textures
        }
    }

    pub fn group_ids(&self, name: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|group| group.name == name)
            .flat_map(|group| group.ids.iter().cloned())
            .collect()
    }

    pub fn hit_area(&self, name: &str) -> Option<&HitArea> {
        self.hit_areas.iter().find(|area| area.name == name)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        match &self.file_references.moc {
            None => issues.push("model description must reference a moc file".to_string()),
            Some(path) if is_blank(path) => {
                issues.push("moc reference may not be empty".to_string())
            }
            Some(_) => {}
        }

        let mut names = BTreeSet::new();
        for expression in &self.file_references.expressions {
            if expression.name.trim().is_empty() {
                issues.push(format!(
                    "expression '{}' has an empty name",
                    expression.file.display()
                ));
            } else if !names.insert(expression.name.as_str()) {
                issues.push(format!("expression '{}' declared twice", expression.name));
            }
            if is_blank(&expression.file) {
                issues.push(format!("expression '{}' has no file", expression.name));
            }
        }

        for (group, motions) in &self.file_references.motions {
            if group.trim().is_empty() {
                issues.push("motion group name may not be empty".to_string());
            }
            for (index, motion) in motions.iter().enumerate() {
                if is_blank(&motion.file) {
                    issues.push(format!("motion {group}[{index}] has no file"));
                }
                for (label, value) in [
                    ("FadeInTime", motion.fade_in_time),
                    ("FadeOutTime", motion.fade_out_time),
                ] {
                    if value.is_some_and(|secs| !secs.is_finite() || secs < 0.0) {
                        issues.push(format!("motion {group}[{index}] {label} must be >= 0"));
                    }
                }
            }
        }

        let mut hit_names = BTreeSet::new();
        for area in &self.hit_areas {
            if area.id.trim().is_empty() {
                issues.push(format!("hit area '{}' has an empty id", area.name));
            }
            if !hit_names.insert(area.name.as_str()) {
                issues.push(format!("hit area '{}' declared twice", area.name));
            }
        }
        issues
    }
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().is_empty()
}
