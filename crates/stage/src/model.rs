use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use glam::Mat4;
use modelpack::{ModelAsset, ModelPack};
use sequencer::{AnimationTarget, MotionRequest};
use tracing::{debug, warn};

use crate::binder::{PendingTextureBinder, RendererAvailability};
use crate::engine::{EngineError, EngineModel, RenderEngine, TextureId};
use crate::error::{ErrorCode, StageError};
use crate::guard::RenderThread;
use crate::textures::TextureManager;
use crate::types::{ModelId, ModelState, MotionRef};

/// The stage's side of one loaded engine model.
pub(crate) struct ModelHandle {
    id: ModelId,
    source: PathBuf,
    pack: ModelPack,
    engine: Box<dyn EngineModel>,
    texture_slots: BTreeMap<usize, Option<TextureId>>,
    binder: PendingTextureBinder,
    renderer: RendererAvailability,
    state: ModelState,
    draw_failing: bool,
}

impl ModelHandle {
    pub(crate) fn id(&self) -> ModelId {
        self.id
    }

    pub(crate) fn source(&self) -> &Path {
        &self.source
    }

    pub(crate) fn pack(&self) -> &ModelPack {
        &self.pack
    }

    pub(crate) fn state(&self) -> &ModelState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ModelState {
        &mut self.state
    }

    pub(crate) fn texture_slots(&self) -> &BTreeMap<usize, Option<TextureId>> {
        &self.texture_slots
    }

    pub(crate) fn pending_textures(&self) -> usize {
        self.binder.len()
    }

    pub(crate) fn drain_pending(&mut self) -> usize {
        if self.binder.is_empty() {
            return 0;
        }
        let engine = &mut self.engine;
        self.binder
            .drain(self.renderer, |slot, texture| engine.bind_texture(slot, texture))
    }

    /// Starts an idle motion straight on the engine. Idle motions are filler
    /// and not part of the model's recorded state.
    pub(crate) fn start_idle_motion(&mut self, request: &MotionRequest) -> Result<(), EngineError> {
        self.engine
            .start_motion(&request.group, request.index, request.priority)
    }

    pub(crate) fn hit_test(&self, area_name: &str, x: f32, y: f32) -> bool {
        self.pack
            .hit_area(area_name)
            .is_some_and(|area| self.engine.hit_test(&area.id, x, y))
    }

    pub(crate) fn set_dragging(&mut self, x: f32, y: f32) {
        self.engine.set_dragging(x, y);
    }

    pub(crate) fn set_lip_sync(&mut self, value: f32) {
        self.engine.set_lip_sync(value);
    }

    pub(crate) fn set_auto_blink(&mut self, enabled: bool) {
        self.engine.set_auto_blink(enabled);
    }

    pub(crate) fn set_auto_breath(&mut self, enabled: bool) {
        self.engine.set_auto_breath(enabled);
    }

    pub(crate) fn canvas_width(&self) -> f32 {
        self.engine.canvas_width()
    }

    /// Binds outstanding textures, advances the engine model and draws it.
    /// Returns the draw error the first time drawing starts failing.
    pub(crate) fn render(&mut self, delta: Duration, mvp: &Mat4) -> Option<EngineError> {
        self.drain_pending();
        self.engine.update(delta);
        match self.engine.draw(mvp) {
            Ok(()) => {
                self.draw_failing = false;
                None
            }
            Err(err) if !self.draw_failing => {
                self.draw_failing = true;
                Some(err)
            }
            Err(err) => {
                debug!(model = %self.id, error = %err, "draw still failing");
                None
            }
        }
    }

    /// Frees the engine model and gives back its textures.
    pub(crate) fn release(
        mut self,
        engine: &mut dyn RenderEngine,
        textures: Option<&mut TextureManager>,
    ) {
        self.binder.clear();
        self.engine.release();
        if let Some(textures) = textures {
            textures.release_owner(engine, self.id);
        }
        debug!(model = %self.id, source = %self.source.display(), "model released");
    }
}

impl AnimationTarget for ModelHandle {
    type Error = EngineError;

    fn start_motion(&mut self, request: &MotionRequest) -> Result<(), EngineError> {
        self.engine
            .start_motion(&request.group, request.index, request.priority)?;
        self.state.motion = Some(MotionRef::new(request.group.clone(), request.index));
        Ok(())
    }

    fn motion_finished(&self) -> bool {
        self.engine.is_motion_finished()
    }

    fn apply_expression(&mut self, id: &str) -> Result<(), EngineError> {
        self.engine.set_expression(id)?;
        self.state.expression = Some(id.to_string());
        Ok(())
    }
}

/// Result of constructing a model: the handle plus any texture that could
/// not be decoded (the model still loads with those slots unbound).
pub(crate) struct LoadOutcome {
    pub handle: ModelHandle,
    pub texture_failures: Vec<StageError>,
}

/// Reads the model's assets, constructs the engine model, uploads textures
/// and creates the renderer. On error nothing is left behind.
pub(crate) fn construct_model(
    engine: &mut dyn RenderEngine,
    textures: &mut TextureManager,
    id: ModelId,
    source: &Path,
    max_bind_backoff: u32,
) -> Result<LoadOutcome, StageError> {
    let pack = ModelPack::load(source)?;
    let asset = ModelAsset::read(&pack)?;
    let model = engine
        .load_model(&asset)
        .map_err(|err| StageError::engine("model construction", ErrorCode::ModelLoadFailed, err))?;

    let mut handle = ModelHandle {
        id,
        source: source.to_path_buf(),
        pack,
        engine: model,
        texture_slots: BTreeMap::new(),
        binder: PendingTextureBinder::new(max_bind_backoff),
        renderer: RendererAvailability::Pending,
        state: ModelState::default(),
        draw_failing: false,
    };

    let mut texture_failures = Vec::new();
    for (slot, path) in handle.pack.texture_paths() {
        match textures.acquire(engine, &path, id) {
            Ok(texture) => {
                handle.texture_slots.insert(slot, Some(texture));
                handle.binder.register(slot, texture);
            }
            Err(err) => {
                warn!(model = %id, slot, error = %err, "texture unavailable; slot left unbound");
                handle.texture_slots.insert(slot, None);
                texture_failures.push(err);
            }
        }
    }

    if let Err(err) = handle.engine.create_renderer() {
        handle.release(engine, Some(textures));
        return Err(StageError::engine(
            "renderer creation",
            ErrorCode::ModelLoadFailed,
            err,
        ));
    }
    handle.renderer = RendererAvailability::Available;
    let bound = handle.drain_pending();
    debug!(
        model = %id,
        bound,
        pending = handle.binder.len(),
        "model constructed"
    );

    Ok(LoadOutcome {
        handle,
        texture_failures,
    })
}

/// Loaded models in insertion order; index 0 is the primary model. Only the
/// render thread may touch it.
pub(crate) struct ModelCollection {
    thread: RenderThread,
    models: Vec<ModelHandle>,
}

impl ModelCollection {
    pub(crate) fn new(thread: RenderThread) -> Self {
        Self {
            thread,
            models: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.thread.assert_current("model collection");
        self.models.len()
    }

    pub(crate) fn push(&mut self, handle: ModelHandle) {
        self.thread.assert_current("model collection");
        self.models.push(handle);
    }

    pub(crate) fn primary(&self) -> Option<&ModelHandle> {
        self.thread.assert_current("model collection");
        self.models.first()
    }

    pub(crate) fn primary_mut(&mut self) -> Option<&mut ModelHandle> {
        self.thread.assert_current("model collection");
        self.models.first_mut()
    }

    pub(crate) fn get_mut(&mut self, id: ModelId) -> Option<&mut ModelHandle> {
        self.thread.assert_current("model collection");
        self.models.iter_mut().find(|handle| handle.id == id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ModelHandle> {
        self.thread.assert_current("model collection");
        self.models.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ModelHandle> {
        self.thread.assert_current("model collection");
        self.models.iter_mut()
    }

    pub(crate) fn take_all(&mut self) -> Vec<ModelHandle> {
        self.thread.assert_current("model collection");
        std::mem::take(&mut self.models)
    }
}
