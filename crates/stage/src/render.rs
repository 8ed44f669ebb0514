//! The render-thread side of the embedding. `RenderLoop` owns the resource
//! lifecycle and the animation sequencer, executes queued operations and
//! draws frames. It is created on, and never leaves, the render thread.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver};
use glam::Vec2;
use sequencer::{
    AnimationSequencer, AnimationTarget, MotionRequest, PlaybackState, Priority, SequencerEvent,
};
use settings::StageSettings;
use tracing::{debug, error, info, trace, warn};

use crate::dispatcher::StageHandle;
use crate::engine::RenderEngine;
use crate::error::{ErrorCode, StageError};
use crate::guard::RenderThread;
use crate::lifecycle::{ReadyOutcome, ResourceLifecycle};
use crate::notify::{Notification, Notifier};
use crate::queue::{command_queue, run_guarded, CommandReceiver, OpTag, PumpReport, QueuedOp};
use crate::shared::SharedState;
use crate::types::{
    DesiredState, Generation, LifecycleState, ModelId, ModelState, MotionRef, SurfaceEvent,
    SurfaceRef,
};
use crate::view::{TouchTracker, ViewTransform};

pub struct RenderLoop {
    lifecycle: ResourceLifecycle,
    sequencer: AnimationSequencer,
    commands: CommandReceiver,
    surface_events: Receiver<SurfaceEvent>,
    shared: Arc<SharedState>,
    notifier: Notifier,
    settings: StageSettings,
    view: ViewTransform,
    touch: TouchTracker,
    last_frame: Option<Instant>,
}

impl RenderLoop {
    /// Builds the render side plus the handle callers use and the stream of
    /// notifications. Must be called on the thread that owns the graphics
    /// context.
    pub fn new(
        engine: Box<dyn RenderEngine>,
        settings: StageSettings,
    ) -> (Self, StageHandle, Receiver<Notification>) {
        let thread = RenderThread::current();
        let (queue, commands) = command_queue();
        let (surface_tx, surface_events) = unbounded();
        let (notifier, notifications) = Notifier::channel();
        let shared = Arc::new(SharedState::default());
        let handle = StageHandle::new(
            queue,
            surface_tx,
            Arc::clone(&shared),
            notifier.clone(),
            settings.view.clone(),
        );

        let render = Self {
            lifecycle: ResourceLifecycle::new(
                engine,
                thread,
                settings.textures.max_bind_backoff_frames,
            ),
            sequencer: AnimationSequencer::new(&settings.animation),
            commands,
            surface_events,
            shared,
            notifier,
            settings,
            view: ViewTransform::new(0, 0),
            touch: TouchTracker::default(),
            last_frame: None,
        };
        (render, handle, notifications)
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn generation(&self) -> Generation {
        self.lifecycle.generation()
    }

    pub fn model_count(&self) -> usize {
        self.lifecycle.model_count()
    }

    pub fn model_ids(&self) -> Vec<ModelId> {
        self.lifecycle.model_ids()
    }

    /// Applied state of the primary model.
    pub fn primary_state(&self) -> Option<ModelState> {
        self.lifecycle.primary().map(|handle| handle.state().clone())
    }

    pub fn primary_source(&self) -> Option<&Path> {
        self.lifecycle.primary_source()
    }

    /// Texture slots of the primary model that are still waiting to be bound.
    pub fn pending_textures(&self) -> usize {
        self.lifecycle
            .primary()
            .map_or(0, |handle| handle.pending_textures())
    }

    /// Texture slots of the primary model that have a texture.
    pub fn bound_texture_slots(&self) -> Vec<usize> {
        self.lifecycle.primary().map_or_else(Vec::new, |handle| {
            handle
                .texture_slots()
                .iter()
                .filter(|(_, texture)| texture.is_some())
                .map(|(slot, _)| *slot)
                .collect()
        })
    }

    pub fn texture_count(&self) -> usize {
        self.lifecycle.texture_count()
    }

    pub fn texture_decodes(&self) -> usize {
        self.lifecycle.texture_decodes()
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.sequencer.state()
    }

    pub fn queued_motions(&self) -> Vec<MotionRequest> {
        self.sequencer.queued_motions().cloned().collect()
    }

    pub(crate) fn command_receiver(&self) -> &Receiver<QueuedOp> {
        self.commands.receiver()
    }

    pub(crate) fn surface_receiver(&self) -> &Receiver<SurfaceEvent> {
        &self.surface_events
    }

    pub fn surface_created(&mut self) {
        let result = run_guarded("context creation", || self.lifecycle.context_created());
        if let Err(err) = self.settle(result) {
            error!(code = %err.code(), error = %err, "graphics context unusable");
            self.notifier.error(&err);
        }
    }

    pub fn surface_changed(&mut self, width: u32, height: u32) {
        debug!(width, height, "surface changed");
        self.lifecycle.surface_changed(width, height);
        self.view.resize(width, height);
    }

    pub fn surface_lost(&mut self) {
        self.sequencer.cancel();
        self.lifecycle.context_lost();
        self.touch = TouchTracker::default();
        self.publish();
    }

    pub fn handle_surface_event(&mut self, event: SurfaceEvent) {
        match event {
            SurfaceEvent::Created => self.surface_created(),
            SurfaceEvent::Changed { width, height } => self.surface_changed(width, height),
            SurfaceEvent::Lost => self.surface_lost(),
        }
    }

    /// Applies every surface event delivered so far; returns how many.
    pub fn drain_surface_events(&mut self) -> usize {
        let events: Vec<SurfaceEvent> = self.surface_events.try_iter().collect();
        let count = events.len();
        for event in events {
            self.handle_surface_event(event);
        }
        count
    }

    /// Runs the operations queued when the pump started. Operations issued
    /// against an earlier context are dropped, failures are reported and do
    /// not stop the pump.
    pub fn pump(&mut self) -> PumpReport {
        let mut report = PumpReport::default();
        for _ in 0..self.commands.len() {
            let Some(QueuedOp { tag, label, op }) = self.commands.try_next() else {
                break;
            };
            let current = self.lifecycle.generation();
            if let OpTag::Context(issued) = tag {
                if issued < current {
                    trace!(
                        op = label,
                        issued = %issued,
                        current = %current,
                        "dropping operation from stale context"
                    );
                    report.skipped_stale += 1;
                    continue;
                }
            }

            match run_guarded(label, || op(self)) {
                Ok(()) => report.executed += 1,
                Err(err) => {
                    report.failed += 1;
                    let code = err.code();
                    if code == ErrorCode::EngineError {
                        error!(op = label, code = %code, error = %err, "queued operation failed");
                    } else {
                        warn!(op = label, code = %code, error = %err, "queued operation failed");
                    }
                    self.notifier.error(&err);
                }
            }
        }
        report
    }

    /// Advances animation and draws every model.
    pub fn frame(&mut self, now: Instant) {
        let result = run_guarded("frame", || {
            self.draw_frame(now);
            Ok(())
        });
        if let Err(err) = result {
            error!(error = %err, "frame aborted");
            self.notifier.error(&err);
        }
    }

    /// Final teardown on the render thread.
    pub fn destroy(&mut self) {
        self.lifecycle.destroy(&mut self.sequencer);
        self.publish();
        info!("embedding destroyed");
    }

    fn draw_frame(&mut self, now: Instant) {
        let delta = self
            .last_frame
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default();
        self.last_frame = Some(now);
        if !self.lifecycle.is_ready() {
            return;
        }

        let mouth = self.shared.mouth();
        let mut events = Vec::new();
        if let Some(handle) = self.lifecycle.primary_mut() {
            events = self.sequencer.poll(handle, now);
            if self.sequencer.state() == PlaybackState::Idle && handle.motion_finished() {
                if let Some(group) = self.settings.animation.idle_group.as_deref() {
                    let count = handle.pack().motion_count(group);
                    if count > 0 {
                        let picked = self.sequencer.random_motion(group, count, Priority::Idle);
                        if let Ok(request) = picked {
                            if let Err(err) = handle.start_idle_motion(&request) {
                                debug!(motion = %request, error = %err, "idle motion refused");
                            }
                        }
                    }
                }
            }
            handle.set_lip_sync(mouth);
        }
        self.report(events);

        for (id, err) in self.lifecycle.render(delta, &self.view) {
            warn!(model = %id, error = %err, "draw failed");
            self.notifier
                .error(&StageError::engine(format!("drawing {id}"), ErrorCode::EngineError, err));
        }
    }

    fn publish(&self) {
        self.shared.publish(
            self.lifecycle.state(),
            self.lifecycle.generation(),
            self.lifecycle.primary_source().map(Path::to_path_buf),
        );
    }

    /// Finishes a transition that may have reached `Ready`: rebuilt models
    /// get their state back, then the desired model is brought in.
    fn settle(
        &mut self,
        result: Result<Option<ReadyOutcome>, StageError>,
    ) -> Result<(), StageError> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.publish();
                return Err(err);
            }
        };
        if let Some(outcome) = outcome {
            let (width, height) = self.lifecycle.viewport();
            self.view.resize(width, height);
            self.restore(outcome);
            self.reconcile_desired();
        }
        self.publish();
        Ok(())
    }

    fn restore(&mut self, outcome: ReadyOutcome) {
        for err in &outcome.failures {
            self.notifier.error(err);
        }
        self.sequencer.cancel();
        let desired = self.shared.desired();
        for (position, (id, state)) in outcome.restored.into_iter().enumerate() {
            if position == 0 {
                self.apply_state(id, desired.overlay(&state), &desired);
            } else if let Some(handle) = self.lifecycle.model_mut(id) {
                *handle.state_mut() = state;
            }
            info!(model = %id, "model state restored");
        }
    }

    /// Pushes `state` onto a freshly built model: transform directly, then
    /// expression and motion through the sequencer.
    fn apply_state(&mut self, id: ModelId, state: ModelState, desired: &DesiredState) {
        let replay_priority = self.settings.animation.replay_priority;
        let scale = self.settings.clamp_scale(state.scale);
        let Some(handle) = self.lifecycle.model_mut(id) else {
            return;
        };
        handle.state_mut().scale = scale;
        handle.state_mut().offset = state.offset;
        handle.set_auto_blink(desired.auto_blink);
        handle.set_auto_breath(desired.auto_breath);

        let mut events = Vec::new();
        if let Some(expression) = state.expression {
            events.extend(self.sequencer.set_expression(handle, expression));
        }
        if let Some(motion) = state.motion {
            let request = MotionRequest::new(motion.group, motion.index, replay_priority);
            events.extend(self.sequencer.start_motion(handle, request, Instant::now()));
        }
        self.report(events);
    }

    fn reconcile_desired(&mut self) {
        if !self.lifecycle.is_ready() {
            return;
        }
        let desired = self.shared.desired().model_path;
        let active = self.lifecycle.primary_source().map(Path::to_path_buf);
        match desired {
            Some(path) if active.as_ref() != Some(&path) => {
                if let Err(err) = self.load_model(path) {
                    self.notifier.error(&err);
                }
            }
            None if active.is_some() => {
                self.unload_models();
            }
            _ => {}
        }
    }

    fn report(&self, events: Vec<SequencerEvent>) {
        for event in events {
            match event {
                SequencerEvent::MotionStarted(request) => {
                    debug!(motion = %request, "motion started")
                }
                SequencerEvent::MotionQueued(request) => debug!(motion = %request, "motion queued"),
                SequencerEvent::MotionEvicted(request) => {
                    debug!(motion = %request, "motion dropped from full queue")
                }
                SequencerEvent::MotionFinished(request) => {
                    debug!(motion = %request, "motion finished");
                    self.notifier.send(Notification::MotionFinished {
                        group: request.group,
                        index: request.index,
                    });
                }
                SequencerEvent::MotionFailed { request, message } => {
                    warn!(motion = %request, error = %message, "motion failed");
                    self.notifier.send(Notification::Error {
                        code: ErrorCode::MotionError,
                        message: format!("motion {}#{}: {message}", request.group, request.index),
                    });
                }
                SequencerEvent::ExpressionApplied(id) => {
                    debug!(expression = %id, "expression applied")
                }
                SequencerEvent::ExpressionsSuperseded(ids) => {
                    debug!(superseded = ?ids, "held expressions superseded")
                }
                SequencerEvent::ExpressionFailed { id, message } => {
                    warn!(expression = %id, error = %message, "expression failed");
                    self.notifier.send(Notification::Error {
                        code: ErrorCode::ExpressionError,
                        message: format!("expression {id}: {message}"),
                    });
                }
            }
        }
    }

    fn require_ready(&self, what: &str) -> bool {
        let ready = self.lifecycle.is_ready();
        if !ready {
            debug!(state = %self.lifecycle.state(), "{what} deferred until ready");
        }
        ready
    }

    fn unload_models(&mut self) {
        self.sequencer.cancel();
        let released = self.lifecycle.unload_all();
        self.publish();
        info!(models = released, "models unloaded");
    }

    pub(crate) fn start(&mut self, surface: SurfaceRef) -> Result<(), StageError> {
        self.view.resize(surface.width, surface.height);
        let result = self.lifecycle.start(surface);
        self.settle(result)
    }

    pub(crate) fn stop(&mut self) -> Result<(), StageError> {
        if self.lifecycle.stop(&mut self.sequencer) {
            self.touch = TouchTracker::default();
        }
        self.publish();
        Ok(())
    }

    pub(crate) fn load_model(&mut self, path: PathBuf) -> Result<(), StageError> {
        if !self.require_ready("model load") {
            return Ok(());
        }
        if self.lifecycle.primary_source() == Some(path.as_path()) {
            debug!(path = %path.display(), "model already active");
            return Ok(());
        }
        if self.shared.desired().model_path.as_deref() != Some(path.as_path()) {
            debug!(path = %path.display(), "model load superseded");
            return Ok(());
        }

        self.sequencer.cancel();
        let (id, texture_failures) = match self.lifecycle.load_model(&path) {
            Ok(loaded) => loaded,
            Err(err) => {
                let active = self.lifecycle.primary_source().map(Path::to_path_buf);
                self.shared.update_desired(|desired| {
                    if desired.model_path.as_deref() == Some(path.as_path()) {
                        desired.model_path = active;
                    }
                });
                self.publish();
                return Err(err);
            }
        };
        for err in &texture_failures {
            self.notifier.error(err);
        }

        let desired = self.shared.desired();
        self.apply_state(id, desired.overlay(&ModelState::default()), &desired);
        self.publish();
        info!(model = %id, path = %path.display(), "model loaded");
        self.notifier.send(Notification::ModelLoaded { path });
        Ok(())
    }

    pub(crate) fn unload(&mut self) -> Result<(), StageError> {
        if self.require_ready("unload") {
            self.unload_models();
        }
        Ok(())
    }

    pub(crate) fn start_motion(&mut self, group: String, index: usize) -> Result<(), StageError> {
        if !self.require_ready("motion") {
            return Ok(());
        }
        let priority = self.settings.animation.motion_priority;
        let Some(handle) = self.lifecycle.primary_mut() else {
            debug!(group = %group, index, "no model loaded; motion kept for the next load");
            return Ok(());
        };
        if handle.pack().motion(&group, index).is_none() {
            return Err(StageError::EngineOperation {
                operation: format!("motion {group}#{index}"),
                code: ErrorCode::MotionError,
                message: "not defined by the model".to_string(),
            });
        }
        let events = self
            .sequencer
            .start_motion(handle, MotionRequest::new(group, index, priority), Instant::now());
        self.report(events);
        Ok(())
    }

    pub(crate) fn set_expression(&mut self, id: String) -> Result<(), StageError> {
        if !self.require_ready("expression") {
            return Ok(());
        }
        let Some(handle) = self.lifecycle.primary_mut() else {
            debug!(expression = %id, "no model loaded; expression kept for the next load");
            return Ok(());
        };
        if handle.pack().expression_path(&id).is_none() {
            return Err(StageError::EngineOperation {
                operation: format!("expression {id}"),
                code: ErrorCode::ExpressionError,
                message: "not defined by the model".to_string(),
            });
        }
        let events = self.sequencer.set_expression(handle, id);
        self.report(events);
        Ok(())
    }

    pub(crate) fn set_scale(&mut self, factor: f32) -> Result<(), StageError> {
        let factor = self.settings.clamp_scale(factor);
        if let Some(handle) = self.lifecycle.primary_mut() {
            handle.state_mut().scale = factor;
        }
        Ok(())
    }

    pub(crate) fn set_position(&mut self, x: f32, y: f32) -> Result<(), StageError> {
        if let Some(handle) = self.lifecycle.primary_mut() {
            handle.state_mut().offset = (x, y);
        }
        Ok(())
    }

    pub(crate) fn set_auto_blink(&mut self, enabled: bool) -> Result<(), StageError> {
        for handle in self.lifecycle.models_mut() {
            handle.set_auto_blink(enabled);
        }
        Ok(())
    }

    pub(crate) fn set_auto_breath(&mut self, enabled: bool) -> Result<(), StageError> {
        for handle in self.lifecycle.models_mut() {
            handle.set_auto_breath(enabled);
        }
        Ok(())
    }

    pub(crate) fn touch_began(&mut self, x: f32, y: f32) -> Result<(), StageError> {
        self.touch.began(x, y);
        self.notifier.send(Notification::Tap { x, y });
        Ok(())
    }

    pub(crate) fn touch_moved(&mut self, x: f32, y: f32) -> Result<(), StageError> {
        if !self.touch.moved(x, y) || !self.lifecycle.is_ready() {
            return Ok(());
        }
        let state = self.primary_state().unwrap_or_default();
        let target = self.view.device_to_view(x, y, &state);
        for handle in self.lifecycle.models_mut() {
            handle.set_dragging(target.x, target.y);
        }
        Ok(())
    }

    pub(crate) fn touch_ended(&mut self, x: f32, y: f32) -> Result<(), StageError> {
        let Some(point) = self.touch.ended(x, y) else {
            return Ok(());
        };
        if !self.lifecycle.is_ready() {
            return Ok(());
        }
        for handle in self.lifecycle.models_mut() {
            handle.set_dragging(0.0, 0.0);
        }
        self.react_to_tap(point);
        Ok(())
    }

    /// Head taps change expression, body taps play a tap motion.
    fn react_to_tap(&mut self, point: Vec2) {
        let replay_priority = self.settings.animation.replay_priority;
        let Some(handle) = self.lifecycle.primary_mut() else {
            return;
        };
        let target = self.view.device_to_view(point.x, point.y, handle.state());
        let areas = &self.settings.hit_areas;

        if handle.hit_test(&areas.head, target.x, target.y) {
            let ids = handle.pack().available_expressions();
            match self.sequencer.random_expression(&ids[..]) {
                Ok(id) => {
                    info!(area = %areas.head, expression = %id, "tap hit");
                    let events = self.sequencer.set_expression(handle, id.clone());
                    self.shared
                        .update_desired(|desired| desired.expression = Some(id));
                    self.report(events);
                }
                Err(err) => debug!(error = %err, "tap on head ignored"),
            }
        } else if handle.hit_test(&areas.body, target.x, target.y) {
            let group = &self.settings.animation.tap_group;
            let count = handle.pack().motion_count(group);
            match self.sequencer.random_motion(group, count, replay_priority) {
                Ok(request) => {
                    info!(area = %areas.body, motion = %request, "tap hit");
                    let motion = MotionRef::new(request.group.clone(), request.index);
                    self.shared
                        .update_desired(|desired| desired.motion = Some(motion));
                    let events = self.sequencer.start_motion(handle, request, Instant::now());
                    self.report(events);
                }
                Err(err) => debug!(error = %err, "tap on body ignored"),
            }
        } else {
            trace!(x = target.x, y = target.y, "tap missed every hit area");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::dispatcher::Dispatch;
    use crate::testing::{test_settings, write_model, EngineProbe, RecordingEngine};

    struct Fixture {
        render: RenderLoop,
        handle: StageHandle,
        notifications: Receiver<Notification>,
        probe: EngineProbe,
        temp: tempfile::TempDir,
        model: PathBuf,
    }

    fn fixture_with(settings: StageSettings) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let model = write_model(temp.path(), "haru")
            .canonicalize()
            .unwrap();
        let probe = EngineProbe::default();
        let (render, handle, notifications) =
            RenderLoop::new(Box::new(RecordingEngine::new(probe.clone())), settings);
        Fixture {
            render,
            handle,
            notifications,
            probe,
            temp,
            model,
        }
    }

    /// Started, context up, haru loaded.
    fn loaded() -> Fixture {
        let mut fx = fixture_with(test_settings());
        fx.handle.start(SurfaceRef::new(1, 800, 600)).unwrap();
        fx.render.surface_created();
        fx.render.pump();
        fx.handle.load_model(&fx.model.display().to_string()).unwrap();
        fx.render.pump();
        fx.notifications.try_iter().for_each(drop);
        fx
    }

    fn model_path(fx: &Fixture) -> String {
        fx.model.display().to_string()
    }

    fn errors(notifications: &Receiver<Notification>) -> Vec<ErrorCode> {
        notifications
            .try_iter()
            .filter_map(|notification| match notification {
                Notification::Error { code, .. } => Some(code),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn load_reports_and_binds_textures() {
        let mut fx = fixture_with(test_settings());
        fx.handle.start(SurfaceRef::new(1, 800, 600)).unwrap();
        fx.render.surface_created();
        fx.handle.load_model(&model_path(&fx)).unwrap();
        let report = fx.render.pump();
        // the load queued before the context existed is replayed from the
        // desired state; the queued copy is stale by then
        assert_eq!(report.executed, 1);
        assert_eq!(report.skipped_stale, 1);

        assert_eq!(fx.render.state(), LifecycleState::Ready);
        assert_eq!(fx.render.model_count(), 1);
        assert_eq!(fx.render.pending_textures(), 0);
        assert_eq!(fx.render.bound_texture_slots(), vec![0, 1]);
        assert_eq!(fx.handle.active_model(), Some(fx.model.clone()));
        assert_eq!(fx.probe.log().binds.len(), 2);
        assert_eq!(
            fx.notifications.try_iter().collect::<Vec<_>>(),
            vec![Notification::ModelLoaded {
                path: fx.model.clone()
            }]
        );
    }

    #[test]
    fn reloading_the_active_model_is_a_no_op() {
        let mut fx = loaded();

        assert_eq!(
            fx.handle.load_model(&model_path(&fx)).unwrap(),
            Dispatch::AlreadyLoaded
        );
        fx.render.pump();

        assert_eq!(fx.render.model_count(), 1);
        assert_eq!(fx.render.texture_decodes(), 2);
        assert_eq!(fx.probe.log().model_loads.len(), 1);
    }

    #[test]
    fn rapid_duplicate_loads_decode_once() {
        let mut fx = fixture_with(test_settings());
        fx.handle.start(SurfaceRef::new(1, 800, 600)).unwrap();
        fx.render.surface_created();
        fx.render.pump();

        assert_eq!(fx.handle.load_model(&model_path(&fx)).unwrap(), Dispatch::Scheduled);
        assert_eq!(
            fx.handle.load_model(&model_path(&fx)).unwrap(),
            Dispatch::Deduplicated
        );
        fx.render.pump();
        assert_eq!(fx.render.model_count(), 1);
        assert_eq!(fx.render.texture_decodes(), 2);
    }

    #[test]
    fn load_before_start_happens_once_ready() {
        let mut fx = fixture_with(test_settings());
        fx.handle.load_model(&model_path(&fx)).unwrap();
        fx.handle.set_scale(1.5).unwrap();
        fx.handle.start(SurfaceRef::new(1, 800, 600)).unwrap();
        fx.render.pump();
        assert_eq!(fx.render.state(), LifecycleState::Starting);
        assert_eq!(fx.render.model_count(), 0);

        fx.render.surface_created();
        assert_eq!(fx.render.state(), LifecycleState::Ready);
        assert_eq!(fx.render.model_count(), 1);
        assert_eq!(fx.render.primary_state().unwrap().scale, 1.5);
    }

    #[test]
    fn later_load_supersedes_earlier_one() {
        let mut fx = loaded();
        let second = write_model(fx.temp.path(), "mao").canonicalize().unwrap();
        let third = write_model(fx.temp.path(), "hiyori").canonicalize().unwrap();

        fx.handle.load_model(&second.display().to_string()).unwrap();
        fx.handle.load_model(&third.display().to_string()).unwrap();
        fx.render.pump();

        assert_eq!(fx.render.primary_source(), Some(third.as_path()));
        assert_eq!(fx.render.model_count(), 1);
        assert_eq!(fx.probe.log().model_loads.len(), 2);
    }

    #[test]
    fn stop_then_start_comes_back_ready_and_empty() {
        let mut fx = loaded();

        fx.handle.stop().unwrap();
        fx.render.pump();
        assert_eq!(fx.render.state(), LifecycleState::Stopped);
        assert_eq!(fx.handle.lifecycle_state(), LifecycleState::Stopped);

        fx.handle.start(SurfaceRef::new(1, 800, 600)).unwrap();
        fx.render.pump();
        assert_eq!(fx.render.state(), LifecycleState::Ready);
        assert_eq!(fx.render.model_count(), 0);

        fx.handle.load_model(&model_path(&fx)).unwrap();
        fx.render.pump();
        assert_eq!(fx.render.model_count(), 1);
        assert!(errors(&fx.notifications).is_empty());
    }

    #[test]
    fn context_loss_replays_last_known_state() {
        let mut fx = loaded();
        fx.handle.set_scale(1.5).unwrap();
        fx.handle.set_position(0.1, -0.2).unwrap();
        fx.handle.set_expression("e1").unwrap();
        fx.render.pump();
        let before = fx.render.primary_state().unwrap();
        let id = fx.render.model_ids()[0];
        assert_eq!(before.expression.as_deref(), Some("e1"));

        fx.render.surface_lost();
        assert_eq!(fx.render.state(), LifecycleState::ContextLost);
        assert_eq!(fx.render.model_count(), 0);
        fx.render.surface_created();

        assert_eq!(fx.render.state(), LifecycleState::Ready);
        assert_eq!(fx.render.generation().value(), 2);
        assert_eq!(fx.render.model_ids(), vec![id]);
        let after = fx.render.primary_state().unwrap();
        assert_eq!(after.scale, 1.5);
        assert_eq!(after.offset, (0.1, -0.2));
        assert_eq!(after.expression.as_deref(), Some("e1"));
        assert_eq!(fx.render.bound_texture_slots(), vec![0, 1]);
        let log = fx.probe.log();
        assert_eq!(log.expressions, vec!["e1", "e1"]);
        assert!(log.textures_deleted.is_empty());
    }

    #[test]
    fn stale_operations_are_dropped_silently() {
        let mut fx = loaded();
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ran);
        let issued = fx.handle.generation();
        assert_eq!(issued.value(), 1);
        fx.handle
            .queue()
            .submit(OpTag::Context(issued), "probe", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        fx.render.surface_lost();
        fx.render.surface_created();
        let report = fx.render.pump();

        assert_eq!(report.skipped_stale, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(errors(&fx.notifications).is_empty());
    }

    #[test]
    fn motions_beyond_capacity_evict_the_oldest() {
        let mut fx = loaded();
        for index in 0..6 {
            fx.handle.start_motion("TapBody", index).unwrap();
        }
        fx.render.pump();

        let queued: Vec<usize> = fx
            .render
            .queued_motions()
            .iter()
            .map(|request| request.index)
            .collect();
        assert_eq!(queued, vec![3, 4, 5]);
        assert_eq!(fx.render.playback_state(), PlaybackState::Playing);
        assert_eq!(fx.probe.log().motions.len(), 1);
        assert_eq!(fx.probe.log().motions[0].2, Priority::Force);
    }

    #[test]
    fn finished_motion_is_announced_and_next_starts() {
        let mut fx = loaded();
        fx.handle.start_motion("TapBody", 1).unwrap();
        fx.handle.start_motion("TapBody", 2).unwrap();
        fx.render.pump();

        let start = Instant::now();
        fx.render.frame(start);
        fx.probe.finish_motion();
        fx.render.frame(start + Duration::from_millis(30));

        assert_eq!(
            fx.notifications.try_iter().collect::<Vec<_>>(),
            vec![Notification::MotionFinished {
                group: "TapBody".into(),
                index: 1
            }]
        );
        let motions: Vec<usize> = fx.probe.log().motions.iter().map(|m| m.1).collect();
        assert_eq!(motions, vec![1, 2]);
        assert!(fx.probe.log().draws >= 2);
    }

    #[test]
    fn expressions_held_during_motion_keep_only_the_newest() {
        let mut fx = loaded();
        fx.handle.start_motion("TapBody", 0).unwrap();
        fx.handle.set_expression("e1").unwrap();
        fx.handle.set_expression("e2").unwrap();
        fx.handle.set_expression("e3").unwrap();
        fx.render.pump();
        assert!(fx.probe.log().expressions.is_empty());

        fx.probe.finish_motion();
        fx.render.frame(Instant::now() + Duration::from_millis(50));
        assert_eq!(fx.probe.log().expressions, vec!["e3"]);
    }

    #[test]
    fn unknown_motion_and_expression_are_reported() {
        let mut fx = loaded();
        fx.handle.start_motion("TapBody", 42).unwrap();
        fx.handle.set_expression("nope").unwrap();
        let report = fx.render.pump();

        assert_eq!(report.failed, 2);
        assert_eq!(
            errors(&fx.notifications),
            vec![ErrorCode::MotionError, ErrorCode::ExpressionError]
        );
        assert_eq!(fx.render.state(), LifecycleState::Ready);
    }

    #[test]
    fn engine_panic_becomes_an_error_notification() {
        let mut fx = loaded();
        fx.probe.controls().panic_on_expression = Some("e2".into());
        fx.handle.set_expression("e2").unwrap();
        fx.handle.set_scale(2.0).unwrap();
        let report = fx.render.pump();

        assert_eq!(report.failed, 1);
        assert_eq!(report.executed, 1);
        assert_eq!(errors(&fx.notifications), vec![ErrorCode::EngineError]);
        assert_eq!(fx.render.primary_state().unwrap().scale, 2.0);
    }

    #[test]
    fn failed_binds_are_retried_on_later_frames() {
        let mut fx = fixture_with(test_settings());
        fx.probe.controls().fail_bind_slots.insert(1);
        fx.handle.start(SurfaceRef::new(1, 800, 600)).unwrap();
        fx.render.surface_created();
        fx.handle.load_model(&model_path(&fx)).unwrap();
        fx.render.pump();
        assert_eq!(fx.render.pending_textures(), 1);

        fx.probe.controls().fail_bind_slots.clear();
        let start = Instant::now();
        for frame in 0..4 {
            fx.render.frame(start + Duration::from_millis(16 * frame));
        }
        assert_eq!(fx.render.pending_textures(), 0);
        let slots: Vec<usize> = fx.probe.log().binds.iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, vec![0, 1]);
    }

    #[test]
    fn missing_texture_still_loads_the_model() {
        let mut fx = fixture_with(test_settings());
        std::fs::remove_file(fx.temp.path().join("textures/t1.png")).unwrap();
        fx.handle.start(SurfaceRef::new(1, 800, 600)).unwrap();
        fx.render.surface_created();
        fx.handle.load_model(&model_path(&fx)).unwrap();
        fx.render.pump();

        assert_eq!(fx.render.model_count(), 1);
        assert_eq!(fx.render.bound_texture_slots(), vec![0]);
        let notifications: Vec<_> = fx.notifications.try_iter().collect();
        assert!(matches!(
            notifications[0],
            Notification::Error {
                code: ErrorCode::AssetLoadFailed,
                ..
            }
        ));
        assert!(matches!(notifications[1], Notification::ModelLoaded { .. }));
    }

    #[test]
    fn failed_load_restores_desired_path() {
        let mut fx = loaded();
        let broken = fx.temp.path().join("broken.model3.json");
        std::fs::write(&broken, "{ not json").unwrap();

        fx.handle.load_model(&broken.display().to_string()).unwrap();
        fx.render.pump();

        assert_eq!(errors(&fx.notifications), vec![ErrorCode::AssetLoadFailed]);
        assert_eq!(fx.render.primary_source(), Some(fx.model.as_path()));
        assert_eq!(fx.handle.desired_state().model_path, Some(fx.model.clone()));
    }

    #[test]
    fn touch_taps_drag_and_hit_areas() {
        let mut fx = loaded();
        fx.probe.controls().head_hit = true;

        fx.handle.touch_moved(10.0, 10.0).unwrap();
        fx.handle.touch_began(400.0, 300.0).unwrap();
        fx.handle.touch_moved(400.0, 0.0).unwrap();
        fx.handle.touch_ended(400.0, 0.0).unwrap();
        fx.render.pump();

        assert_eq!(
            fx.notifications.try_iter().collect::<Vec<_>>(),
            vec![Notification::Tap { x: 400.0, y: 300.0 }]
        );
        let log = fx.probe.log();
        assert_eq!(log.dragging.len(), 2);
        let (dx, dy) = log.dragging[0];
        assert!(dx.abs() < 1e-5 && (dy - 1.0).abs() < 1e-5);
        assert_eq!(log.dragging[1], (0.0, 0.0));
        assert_eq!(log.expressions.len(), 1);
        drop(log);
        assert_eq!(
            fx.handle.desired_state().expression,
            fx.render.primary_state().unwrap().expression
        );
    }

    #[test]
    fn body_tap_plays_a_tap_motion_at_replay_priority() {
        let mut fx = loaded();
        fx.probe.controls().body_hit = true;
        fx.handle.touch_began(100.0, 100.0).unwrap();
        fx.handle.touch_ended(100.0, 100.0).unwrap();
        fx.render.pump();

        let log = fx.probe.log();
        assert_eq!(log.motions.len(), 1);
        assert_eq!(log.motions[0].0, "TapBody");
        assert_eq!(log.motions[0].2, Priority::Normal);
    }

    #[test]
    fn tap_motion_survives_context_loss() {
        let mut fx = loaded();
        fx.handle.start_motion("TapBody", 5).unwrap();
        fx.render.pump();
        let start = Instant::now();
        fx.render.frame(start);
        fx.probe.finish_motion();
        fx.render.frame(start + Duration::from_millis(30));

        fx.probe.controls().body_hit = true;
        fx.handle.touch_began(100.0, 100.0).unwrap();
        fx.handle.touch_ended(100.0, 100.0).unwrap();
        fx.render.pump();
        let before = fx.render.primary_state().unwrap().motion;
        assert!(before.is_some());
        assert_eq!(fx.handle.desired_state().motion, before);

        fx.render.surface_lost();
        fx.render.surface_created();

        assert_eq!(fx.render.primary_state().unwrap().motion, before);
        assert_eq!(fx.handle.desired_state().motion, before);
    }

    #[test]
    fn start_stop_start_without_a_pump_ends_ready() {
        let mut fx = fixture_with(test_settings());
        fx.render.surface_created();
        let surface = SurfaceRef::new(1, 800, 600);
        assert_eq!(fx.handle.start(surface).unwrap(), Dispatch::Scheduled);
        assert_eq!(fx.handle.stop().unwrap(), Dispatch::Scheduled);
        assert_eq!(fx.handle.start(surface).unwrap(), Dispatch::Scheduled);
        let report = fx.render.pump();

        assert_eq!(report.executed, 3);
        assert_eq!(fx.render.state(), LifecycleState::Ready);
        assert_eq!(fx.handle.lifecycle_state(), LifecycleState::Ready);
    }

    #[test]
    fn load_unload_load_without_a_pump_keeps_the_model() {
        let mut fx = fixture_with(test_settings());
        fx.handle.start(SurfaceRef::new(1, 800, 600)).unwrap();
        fx.render.surface_created();
        fx.render.pump();

        let path = model_path(&fx);
        assert_eq!(fx.handle.load_model(&path).unwrap(), Dispatch::Scheduled);
        assert_eq!(fx.handle.unload().unwrap(), Dispatch::Scheduled);
        assert_eq!(fx.handle.load_model(&path).unwrap(), Dispatch::Scheduled);
        fx.render.pump();

        assert_eq!(fx.render.model_count(), 1);
        assert_eq!(fx.handle.active_model(), Some(fx.model.clone()));
        assert!(errors(&fx.notifications).is_empty());
    }

    #[test]
    fn returning_to_an_earlier_value_is_applied() {
        let mut fx = loaded();
        for id in ["e1", "e2", "e1"] {
            assert_eq!(fx.handle.set_expression(id).unwrap(), Dispatch::Scheduled);
        }
        for factor in [1.5, 2.0, 1.5] {
            assert_eq!(fx.handle.set_scale(factor).unwrap(), Dispatch::Scheduled);
        }
        fx.render.pump();

        let state = fx.render.primary_state().unwrap();
        assert_eq!(state.expression.as_deref(), Some("e1"));
        assert_eq!(state.scale, 1.5);
        assert_eq!(fx.probe.log().expressions, vec!["e1", "e2", "e1"]);
        let desired = fx.handle.desired_state();
        assert_eq!(desired.expression.as_deref(), Some("e1"));
        assert_eq!(desired.scale, Some(1.5));
    }

    #[test]
    fn idle_motion_fills_gaps() {
        let mut settings = test_settings();
        settings.animation.idle_group = Some("Idle".into());
        let mut fx = fixture_with(settings);
        fx.handle.start(SurfaceRef::new(1, 800, 600)).unwrap();
        fx.render.surface_created();
        fx.handle.load_model(&model_path(&fx)).unwrap();
        fx.render.pump();

        fx.render.frame(Instant::now());
        let log = fx.probe.log();
        assert_eq!(log.motions, vec![("Idle".to_string(), 0, Priority::Idle)]);
        drop(log);
        assert_eq!(fx.render.playback_state(), PlaybackState::Idle);
        assert_eq!(fx.render.primary_state().unwrap().motion, None);
    }

    #[test]
    fn frames_forward_mouth_value_and_transform() {
        let mut fx = loaded();
        fx.handle.set_mouth_value(0.4).unwrap();
        fx.handle.set_scale(2.0).unwrap();
        fx.render.pump();
        fx.render.frame(Instant::now());

        let log = fx.probe.log();
        assert_eq!(log.lip_sync, Some(0.4));
        let mvp = log.last_mvp.expect("drawn");
        let corner = mvp.transform_point3(glam::Vec3::new(1.0, 1.0, 0.0));
        assert!((corner.x - 1.5).abs() < 1e-5);
        assert!((corner.y - 2.0).abs() < 1e-5);
    }

    #[test]
    fn draw_failures_are_reported_once() {
        let mut fx = loaded();
        fx.probe.controls().fail_draw = true;
        let start = Instant::now();
        for frame in 0..3 {
            fx.render.frame(start + Duration::from_millis(16 * frame));
        }
        assert_eq!(errors(&fx.notifications), vec![ErrorCode::EngineError]);
    }

    #[test]
    fn desired_state_reaches_a_model_loaded_later() {
        let mut fx = fixture_with(test_settings());
        fx.handle.start(SurfaceRef::new(1, 800, 600)).unwrap();
        fx.render.surface_created();
        fx.handle.set_expression("e2").unwrap();
        fx.handle.start_motion("TapBody", 4).unwrap();
        fx.handle.set_auto_breath(false).unwrap();
        fx.render.pump();
        assert!(fx.probe.log().expressions.is_empty());

        fx.handle.load_model(&model_path(&fx)).unwrap();
        fx.render.pump();
        let state = fx.render.primary_state().unwrap();
        assert_eq!(state.expression.as_deref(), Some("e2"));
        assert_eq!(state.motion, Some(MotionRef::new("TapBody", 4)));
        let log = fx.probe.log();
        assert_eq!(log.auto_breath, Some(false));
        assert_eq!(log.motions[0].2, Priority::Normal);
    }

    #[test]
    fn unload_clears_models_and_textures() {
        let mut fx = loaded();
        fx.handle.unload().unwrap();
        fx.render.pump();

        assert_eq!(fx.render.model_count(), 0);
        assert_eq!(fx.render.texture_count(), 0);
        assert_eq!(fx.handle.active_model(), None);
        assert_eq!(fx.probe.log().textures_deleted.len(), 2);
    }

    #[test]
    fn destroy_releases_everything_and_disposes_engine() {
        let mut fx = loaded();
        fx.render.destroy();

        assert_eq!(fx.render.state(), LifecycleState::Stopped);
        let log = fx.probe.log();
        assert!(log.disposed);
        assert_eq!(log.models_released, 1);
        assert_eq!(log.view_resources_released, 1);
    }
}
