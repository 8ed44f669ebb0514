use std::fs;
use std::path::{Path, PathBuf};

use crate::pack::PackError;

pub const DESCRIPTION_SUFFIX: &str = ".model3.json";

/// Every model description below `root`, sorted by path. Unreadable
/// subdirectories are skipped; an unreadable `root` is an error.
pub fn discover_models(root: impl AsRef<Path>) -> Result<Vec<PathBuf>, PackError> {
    let root = root.as_ref();
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    let mut first = true;

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if first => return Err(err.into()),
            Err(err) => {
                tracing::debug!(
                    dir = %dir.display(),
                    error = %err,
                    "skipping unreadable directory"
                );
                continue;
            }
        };
        first = false;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_description(&path) {
                found.push(path);
            }
        }
    }

    found.sort();
    Ok(found)
}

pub fn is_description(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| {
            name.len() > DESCRIPTION_SUFFIX.len() && name.ends_with(DESCRIPTION_SUFFIX)
        })
}
