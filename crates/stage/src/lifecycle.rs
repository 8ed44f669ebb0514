use std::mem;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sequencer::AnimationSequencer;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, RenderEngine};
use crate::error::{ErrorCode, StageError};
use crate::guard::RenderThread;
use crate::model::{construct_model, LoadOutcome, ModelCollection, ModelHandle};
use crate::textures::TextureManager;
use crate::types::{Generation, LifecycleState, ModelId, ModelState, SurfaceRef};
use crate::view::ViewTransform;

/// Enough to rebuild a model after its context went away.
#[derive(Debug, Clone)]
pub(crate) struct ReplayRecord {
    pub id: ModelId,
    pub source: PathBuf,
    pub state: ModelState,
}

/// Models brought back by a transition into `Ready`, in collection order,
/// with the state each had before.
#[derive(Debug, Default)]
pub(crate) struct ReadyOutcome {
    pub restored: Vec<(ModelId, ModelState)>,
    pub failures: Vec<StageError>,
}

/// Owns the engine, the graphics-context bookkeeping, the model collection
/// and the texture manager, and moves them through the lifecycle states.
pub(crate) struct ResourceLifecycle {
    state: LifecycleState,
    generation: Generation,
    context_alive: bool,
    thread: RenderThread,
    engine: Box<dyn RenderEngine>,
    models: Option<ModelCollection>,
    textures: Option<TextureManager>,
    view_resources: bool,
    viewport: (u32, u32),
    replay: Vec<ReplayRecord>,
    next_model_id: u64,
    max_bind_backoff: u32,
}

impl ResourceLifecycle {
    pub(crate) fn new(
        engine: Box<dyn RenderEngine>,
        thread: RenderThread,
        max_bind_backoff: u32,
    ) -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            generation: Generation::INITIAL,
            context_alive: false,
            thread,
            engine,
            models: None,
            textures: None,
            view_resources: false,
            viewport: (0, 0),
            replay: Vec::new(),
            next_model_id: 1,
            max_bind_backoff,
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.state
    }

    pub(crate) fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state == LifecycleState::Ready
    }

    pub(crate) fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    fn transition(&mut self, next: LifecycleState) {
        info!(
            from = %self.state,
            to = %next,
            generation = %self.generation,
            "lifecycle transition"
        );
        self.state = next;
    }

    pub(crate) fn start(
        &mut self,
        surface: SurfaceRef,
    ) -> Result<Option<ReadyOutcome>, StageError> {
        match self.state {
            LifecycleState::Uninitialized | LifecycleState::Stopped => {}
            state => {
                return Err(StageError::InvalidTransition {
                    state,
                    event: "start",
                })
            }
        }

        self.transition(LifecycleState::Starting);
        self.models = Some(ModelCollection::new(self.thread));
        self.textures = Some(TextureManager::new(self.thread));
        self.viewport = (surface.width, surface.height);
        debug!(
            surface = surface.id,
            width = surface.width,
            height = surface.height,
            "surface attached"
        );

        if self.context_alive {
            self.enter_ready().map(Some)
        } else {
            Ok(None)
        }
    }

    pub(crate) fn context_created(&mut self) -> Result<Option<ReadyOutcome>, StageError> {
        match self.state {
            LifecycleState::Starting => {
                self.context_alive = true;
                self.enter_ready().map(Some)
            }
            LifecycleState::ContextLost => {
                self.context_alive = true;
                self.transition(LifecycleState::Recreating);
                self.enter_ready().map(Some)
            }
            LifecycleState::Ready => {
                warn!("graphics context recreated without a loss callback; rebuilding resources");
                self.context_lost();
                self.context_created()
            }
            state => {
                debug!(state = %state, "graphics context available; waiting for start");
                self.context_alive = true;
                Ok(None)
            }
        }
    }

    /// Forgets every context-bound handle. Model state is kept so the models
    /// can be rebuilt once a new context arrives.
    pub(crate) fn context_lost(&mut self) {
        self.context_alive = false;
        if self.state != LifecycleState::Ready {
            debug!(state = %self.state, "graphics context lost");
            return;
        }

        self.transition(LifecycleState::ContextLost);
        let handles = self
            .models
            .as_mut()
            .map(ModelCollection::take_all)
            .unwrap_or_default();
        for handle in handles {
            self.replay.push(ReplayRecord {
                id: handle.id(),
                source: handle.source().to_path_buf(),
                state: handle.state().clone(),
            });
            handle.release(self.engine.as_mut(), None);
        }
        if let Some(textures) = self.textures.as_mut() {
            let forgotten = textures.abandon();
            debug!(textures = forgotten, "texture handles invalidated with the context");
        }
        self.view_resources = false;
    }

    pub(crate) fn surface_changed(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
        if self.is_ready() {
            self.engine.set_viewport(width, height);
        }
    }

    fn enter_ready(&mut self) -> Result<ReadyOutcome, StageError> {
        self.generation = self.generation.next();
        let fallback = if self.state == LifecycleState::Recreating {
            LifecycleState::ContextLost
        } else {
            self.state
        };

        let init = self
            .engine
            .initialize()
            .and_then(|()| self.engine.create_view_resources());
        if let Err(err) = init {
            self.state = fallback;
            return Err(gl_init_error(err));
        }
        self.view_resources = true;
        let (width, height) = self.viewport;
        self.engine.set_viewport(width, height);
        self.textures = Some(TextureManager::new(self.thread));

        let mut outcome = ReadyOutcome::default();
        for record in mem::take(&mut self.replay) {
            match self.construct(record.id, &record.source) {
                Ok(loaded) => {
                    outcome.failures.extend(loaded.texture_failures);
                    if let Some(models) = self.models.as_mut() {
                        models.push(loaded.handle);
                    }
                    outcome.restored.push((record.id, record.state));
                }
                Err(err) => {
                    warn!(
                        model = %record.id,
                        source = %record.source.display(),
                        error = %err,
                        "model could not be rebuilt"
                    );
                    outcome.failures.push(err);
                }
            }
        }

        self.transition(LifecycleState::Ready);
        Ok(outcome)
    }

    fn construct(&mut self, id: ModelId, source: &Path) -> Result<LoadOutcome, StageError> {
        let thread = self.thread;
        let textures = self
            .textures
            .get_or_insert_with(|| TextureManager::new(thread));
        construct_model(
            self.engine.as_mut(),
            textures,
            id,
            source,
            self.max_bind_backoff,
        )
    }

    /// Loads `source` as the new primary model. Models it supersedes are
    /// released only after it loaded, so a failed load keeps the old one.
    pub(crate) fn load_model(
        &mut self,
        source: &Path,
    ) -> Result<(ModelId, Vec<StageError>), StageError> {
        if !self.is_ready() {
            return Err(StageError::InvalidTransition {
                state: self.state,
                event: "load a model",
            });
        }

        let id = ModelId(self.next_model_id);
        self.next_model_id += 1;
        let loaded = self.construct(id, source)?;
        self.release_models();
        if let Some(models) = self.models.as_mut() {
            models.push(loaded.handle);
        }
        Ok((id, loaded.texture_failures))
    }

    /// Releases every model, including ones waiting to be rebuilt.
    pub(crate) fn unload_all(&mut self) -> usize {
        let pending = self.replay.len();
        self.replay.clear();
        pending + self.release_models()
    }

    fn release_models(&mut self) -> usize {
        let handles = self
            .models
            .as_mut()
            .map(ModelCollection::take_all)
            .unwrap_or_default();
        let count = handles.len();
        let live = self.context_alive && self.view_resources;
        for handle in handles {
            let textures = if live { self.textures.as_mut() } else { None };
            handle.release(self.engine.as_mut(), textures);
        }
        count
    }

    /// Tears everything down: pending animation, models, textures, view
    /// resources, then the collection itself. Returns false when there was
    /// nothing to stop.
    pub(crate) fn stop(&mut self, sequencer: &mut AnimationSequencer) -> bool {
        if matches!(
            self.state,
            LifecycleState::Uninitialized | LifecycleState::Stopped
        ) {
            debug!(state = %self.state, "stop ignored");
            return false;
        }

        let live = self.context_alive && self.view_resources;
        self.transition(LifecycleState::Stopping);

        let cancelled = sequencer.cancel();
        debug!(cancelled, "animation requests cancelled");

        let released = self.release_models();
        self.replay.clear();

        if let Some(mut textures) = self.textures.take() {
            let count = if live {
                textures.dispose(self.engine.as_mut())
            } else {
                textures.abandon()
            };
            debug!(textures = count, deleted = live, "texture manager released");
        }

        if self.view_resources {
            self.engine.release_view_resources();
            self.view_resources = false;
        }

        self.models = None;
        self.transition(LifecycleState::Stopped);
        info!(models = released, "embedding stopped");
        true
    }

    /// Final teardown; the engine is not used again.
    pub(crate) fn destroy(&mut self, sequencer: &mut AnimationSequencer) {
        self.stop(sequencer);
        self.engine.dispose();
    }

    pub(crate) fn primary(&self) -> Option<&ModelHandle> {
        self.models.as_ref()?.primary()
    }

    pub(crate) fn primary_mut(&mut self) -> Option<&mut ModelHandle> {
        self.models.as_mut()?.primary_mut()
    }

    pub(crate) fn model_mut(&mut self, id: ModelId) -> Option<&mut ModelHandle> {
        self.models.as_mut()?.get_mut(id)
    }

    pub(crate) fn models_mut(&mut self) -> impl Iterator<Item = &mut ModelHandle> {
        self.models.iter_mut().flat_map(ModelCollection::iter_mut)
    }

    pub(crate) fn primary_source(&self) -> Option<&Path> {
        self.primary().map(ModelHandle::source)
    }

    pub(crate) fn model_count(&self) -> usize {
        self.models.as_ref().map_or(0, ModelCollection::len)
    }

    pub(crate) fn model_ids(&self) -> Vec<ModelId> {
        self.models
            .as_ref()
            .map(|models| models.iter().map(ModelHandle::id).collect())
            .unwrap_or_default()
    }

    pub(crate) fn texture_count(&self) -> usize {
        self.textures.as_ref().map_or(0, TextureManager::len)
    }

    pub(crate) fn texture_decodes(&self) -> usize {
        self.textures.as_ref().map_or(0, TextureManager::decode_count)
    }

    /// Draws every model; returns models whose drawing just started failing.
    pub(crate) fn render(
        &mut self,
        delta: Duration,
        view: &ViewTransform,
    ) -> Vec<(ModelId, EngineError)> {
        let mut failures = Vec::new();
        for handle in self.models_mut() {
            let mvp = view.model_view_projection(handle.canvas_width(), handle.state());
            if let Some(err) = handle.render(delta, &mvp) {
                failures.push((handle.id(), err));
            }
        }
        failures
    }
}

fn gl_init_error(err: EngineError) -> StageError {
    StageError::engine("graphics initialisation", ErrorCode::GlInitError, err)
}
