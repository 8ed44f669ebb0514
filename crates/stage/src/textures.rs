use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::engine::{RenderEngine, TextureId};
use crate::error::{ErrorCode, StageError};
use crate::guard::RenderThread;
use crate::types::ModelId;

#[derive(Debug)]
struct TextureEntry {
    texture: TextureId,
    owners: BTreeSet<ModelId>,
}

/// GPU textures shared by every loaded model, keyed by source file. A file is
/// decoded once per context; each model that uses it is recorded as an owner
/// and the texture is deleted when the last owner lets go.
#[derive(Debug)]
pub(crate) struct TextureManager {
    thread: RenderThread,
    entries: HashMap<PathBuf, TextureEntry>,
    decodes: usize,
}

impl TextureManager {
    pub(crate) fn new(thread: RenderThread) -> Self {
        Self {
            thread,
            entries: HashMap::new(),
            decodes: 0,
        }
    }

    pub(crate) fn acquire(
        &mut self,
        engine: &mut dyn RenderEngine,
        path: &Path,
        owner: ModelId,
    ) -> Result<TextureId, StageError> {
        self.thread.assert_current("texture manager");
        if let Some(entry) = self.entries.get_mut(path) {
            entry.owners.insert(owner);
            trace!(path = %path.display(), texture = entry.texture.0, "reusing decoded texture");
            return Ok(entry.texture);
        }

        let image = image::open(path)
            .map_err(|source| StageError::TextureDecode {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgba8();
        self.decodes += 1;
        let texture = engine.create_texture(&image).map_err(|err| {
            StageError::engine(
                format!("texture upload for {}", path.display()),
                ErrorCode::EngineError,
                err,
            )
        })?;
        debug!(
            path = %path.display(),
            texture = texture.0,
            width = image.width(),
            height = image.height(),
            "texture created"
        );
        self.entries.insert(
            path.to_path_buf(),
            TextureEntry {
                texture,
                owners: BTreeSet::from([owner]),
            },
        );
        Ok(texture)
    }

    /// Drops `owner` from every texture and deletes the ones nobody else uses.
    pub(crate) fn release_owner(&mut self, engine: &mut dyn RenderEngine, owner: ModelId) -> usize {
        self.thread.assert_current("texture manager");
        let mut orphaned = Vec::new();
        for (path, entry) in self.entries.iter_mut() {
            if entry.owners.remove(&owner) && entry.owners.is_empty() {
                orphaned.push(path.clone());
            }
        }
        for path in &orphaned {
            if let Some(entry) = self.entries.remove(path) {
                engine.delete_texture(entry.texture);
            }
        }
        orphaned.len()
    }

    /// Deletes every texture.
    pub(crate) fn dispose(&mut self, engine: &mut dyn RenderEngine) -> usize {
        self.thread.assert_current("texture manager");
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            engine.delete_texture(entry.texture);
        }
        count
    }

    /// Forgets every texture without deleting it; used once the context that
    /// owned them is gone.
    pub(crate) fn abandon(&mut self) -> usize {
        self.thread.assert_current("texture manager");
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn decode_count(&self) -> usize {
        self.decodes
    }
}
