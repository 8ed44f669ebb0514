//! Caller-side command surface. Every call validates its arguments, records
//! the caller's desired state, and hands the graphics work to the render
//! thread through the command queue. Nothing here blocks on the render
//! thread; outcomes arrive as [`Notification`]s.
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Sender;
use modelpack::ModelSource;
use settings::ViewSettings;
use tracing::debug;

use crate::error::StageError;
use crate::notify::Notifier;
use crate::queue::{CommandQueue, OpTag};
use crate::render::RenderLoop;
use crate::shared::SharedState;
use crate::types::{
    DesiredState, Generation, LifecycleState, MotionRef, SurfaceEvent, SurfaceRef,
};

/// Identity of a request for de-duplication: operation plus its salient
/// arguments. Floats are compared bitwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DispatchKey {
    Start(u64),
    Stop,
    LoadModel(PathBuf),
    Unload,
    Motion { group: String, index: usize },
    Expression(String),
    Scale(u32),
    Position(u32, u32),
    AutoBlink(bool),
    AutoBreath(bool),
}

/// Requests that supersede one another. Dedup only compares a request with
/// the newest queued one of its family, so `start, stop, start` keeps all
/// three.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum DispatchFamily {
    Lifecycle,
    Model,
    Motion,
    Expression,
    Scale,
    Position,
    AutoBlink,
    AutoBreath,
}

impl DispatchKey {
    pub(crate) fn family(&self) -> DispatchFamily {
        match self {
            Self::Start(_) | Self::Stop => DispatchFamily::Lifecycle,
            Self::LoadModel(_) | Self::Unload => DispatchFamily::Model,
            Self::Motion { .. } => DispatchFamily::Motion,
            Self::Expression(_) => DispatchFamily::Expression,
            Self::Scale(_) => DispatchFamily::Scale,
            Self::Position(..) => DispatchFamily::Position,
            Self::AutoBlink(_) => DispatchFamily::AutoBlink,
            Self::AutoBreath(_) => DispatchFamily::AutoBreath,
        }
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start(surface) => write!(f, "start:{surface}"),
            Self::Stop => f.write_str("stop"),
            Self::LoadModel(path) => write!(f, "load:{}", path.display()),
            Self::Unload => f.write_str("unload"),
            Self::Motion { group, index } => write!(f, "motion:{group}#{index}"),
            Self::Expression(id) => write!(f, "expression:{id}"),
            Self::Scale(bits) => write!(f, "scale:{}", f32::from_bits(*bits)),
            Self::Position(x, y) => {
                write!(f, "position:{},{}", f32::from_bits(*x), f32::from_bits(*y))
            }
            Self::AutoBlink(on) => write!(f, "auto-blink:{on}"),
            Self::AutoBreath(on) => write!(f, "auto-breath:{on}"),
        }
    }
}

/// What happened to an accepted call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Scheduled,
    /// The newest queued request of the same kind is identical.
    Deduplicated,
    /// The model is already the active one.
    AlreadyLoaded,
}

/// Releases the dedup key once the queued operation has run or been dropped.
struct InFlight {
    shared: Arc<SharedState>,
    key: DispatchKey,
    ticket: u64,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared.finish(&self.key, self.ticket);
    }
}

/// Cloneable handle callers use to drive the embedding from any thread.
#[derive(Clone)]
pub struct StageHandle {
    queue: CommandQueue,
    surface: Sender<SurfaceEvent>,
    shared: Arc<SharedState>,
    notifier: Notifier,
    view: ViewSettings,
}

impl StageHandle {
    pub(crate) fn new(
        queue: CommandQueue,
        surface: Sender<SurfaceEvent>,
        shared: Arc<SharedState>,
        notifier: Notifier,
        view: ViewSettings,
    ) -> Self {
        Self {
            queue,
            surface,
            shared,
            notifier,
            view,
        }
    }

    /// Raw queue access for hosts that need their own render-thread work.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.shared.lifecycle_state()
    }

    pub fn generation(&self) -> Generation {
        self.shared.generation()
    }

    /// Path of the model currently shown, as last published by the render
    /// thread.
    pub fn active_model(&self) -> Option<PathBuf> {
        self.shared.active_model()
    }

    pub fn desired_state(&self) -> DesiredState {
        self.shared.desired()
    }

    pub fn mouth_value(&self) -> f32 {
        self.shared.mouth()
    }

    /// Number of requests queued but not yet executed or dropped.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    pub fn start(&self, surface: SurfaceRef) -> Result<Dispatch, StageError> {
        self.check(|| {
            if surface.is_valid() {
                Ok(())
            } else {
                Err(StageError::validation(
                    "surface",
                    format!("{}x{} has no area", surface.width, surface.height),
                ))
            }
        })?;
        let key = DispatchKey::Start(surface.id);
        self.dispatch(key, OpTag::Lifecycle, "start", move |stage| stage.start(surface))
    }

    pub fn stop(&self) -> Result<Dispatch, StageError> {
        self.shared.update_desired(|desired| desired.model_path = None);
        self.dispatch(DispatchKey::Stop, OpTag::Lifecycle, "stop", |stage| stage.stop())
    }

    /// Loads the model description at `path` (a filesystem path or
    /// `file://` URI) and makes it the active model.
    pub fn load_model(&self, path: &str) -> Result<Dispatch, StageError> {
        let path = self.check(|| resolve_model_path(path))?;
        if self.shared.active_model().as_deref() == Some(path.as_path())
            && self.shared.desired().model_path.as_deref() == Some(path.as_path())
        {
            debug!(path = %path.display(), "model already active");
            return Ok(Dispatch::AlreadyLoaded);
        }

        let target = path.clone();
        self.shared
            .update_desired(|desired| desired.model_path = Some(path.clone()));
        let key = DispatchKey::LoadModel(path);
        self.dispatch(key, self.context_tag(), "load model", move |stage| {
            stage.load_model(target)
        })
    }

    pub fn unload(&self) -> Result<Dispatch, StageError> {
        self.shared.update_desired(|desired| desired.model_path = None);
        self.dispatch(DispatchKey::Unload, self.context_tag(), "unload", |stage| {
            stage.unload()
        })
    }

    pub fn start_motion(&self, group: &str, index: usize) -> Result<Dispatch, StageError> {
        self.check(|| non_empty("motion group", group))?;
        let motion = MotionRef::new(group, index);
        self.shared
            .update_desired(|desired| desired.motion = Some(motion.clone()));
        let key = DispatchKey::Motion {
            group: group.to_string(),
            index,
        };
        self.dispatch(key, self.context_tag(), "start motion", move |stage| {
            stage.start_motion(motion.group, motion.index)
        })
    }

    pub fn set_expression(&self, id: &str) -> Result<Dispatch, StageError> {
        self.check(|| non_empty("expression id", id))?;
        let id = id.to_string();
        self.shared
            .update_desired(|desired| desired.expression = Some(id.clone()));
        let key = DispatchKey::Expression(id.clone());
        self.dispatch(key, self.context_tag(), "set expression", move |stage| {
            stage.set_expression(id)
        })
    }

    /// Sets the user scale. Values outside the configured range are clamped.
    pub fn set_scale(&self, factor: f32) -> Result<Dispatch, StageError> {
        self.check(|| {
            if factor.is_finite() && factor > 0.0 {
                Ok(())
            } else {
                Err(StageError::validation(
                    "scale",
                    format!("{factor} is not a positive number"),
                ))
            }
        })?;
        let factor = factor.clamp(self.view.min_scale, self.view.max_scale);
        self.shared.update_desired(|desired| desired.scale = Some(factor));
        let key = DispatchKey::Scale(factor.to_bits());
        self.dispatch(key, self.context_tag(), "set scale", move |stage| {
            stage.set_scale(factor)
        })
    }

    pub fn set_position(&self, x: f32, y: f32) -> Result<Dispatch, StageError> {
        self.check(|| finite_point("position", x, y))?;
        self.shared.update_desired(|desired| desired.offset = Some((x, y)));
        let key = DispatchKey::Position(x.to_bits(), y.to_bits());
        self.dispatch(key, self.context_tag(), "set position", move |stage| {
            stage.set_position(x, y)
        })
    }

    pub fn set_auto_blink(&self, enabled: bool) -> Result<Dispatch, StageError> {
        self.shared.update_desired(|desired| desired.auto_blink = enabled);
        let key = DispatchKey::AutoBlink(enabled);
        self.dispatch(key, self.context_tag(), "auto blink", move |stage| {
            stage.set_auto_blink(enabled)
        })
    }

    pub fn set_auto_breath(&self, enabled: bool) -> Result<Dispatch, StageError> {
        self.shared.update_desired(|desired| desired.auto_breath = enabled);
        let key = DispatchKey::AutoBreath(enabled);
        self.dispatch(key, self.context_tag(), "auto breath", move |stage| {
            stage.set_auto_breath(enabled)
        })
    }

    /// Mouth opening for lip sync, clamped to `0..=1`. Read by the render
    /// thread every frame, so it is not queued.
    pub fn set_mouth_value(&self, value: f32) -> Result<(), StageError> {
        self.check(|| {
            if value.is_finite() {
                Ok(())
            } else {
                Err(StageError::validation("mouth value", "must be a finite number"))
            }
        })?;
        self.shared.set_mouth(value.clamp(0.0, 1.0));
        Ok(())
    }

    pub fn touch_began(&self, x: f32, y: f32) -> Result<(), StageError> {
        self.touch("touch began", x, y, RenderLoop::touch_began)
    }

    pub fn touch_moved(&self, x: f32, y: f32) -> Result<(), StageError> {
        self.touch("touch moved", x, y, RenderLoop::touch_moved)
    }

    pub fn touch_ended(&self, x: f32, y: f32) -> Result<(), StageError> {
        self.touch("touch ended", x, y, RenderLoop::touch_ended)
    }

    pub fn surface_created(&self) -> Result<(), StageError> {
        self.send_surface(SurfaceEvent::Created)
    }

    pub fn surface_changed(&self, width: u32, height: u32) -> Result<(), StageError> {
        self.send_surface(SurfaceEvent::Changed { width, height })
    }

    pub fn surface_lost(&self) -> Result<(), StageError> {
        self.send_surface(SurfaceEvent::Lost)
    }

    fn send_surface(&self, event: SurfaceEvent) -> Result<(), StageError> {
        self.surface
            .send(event)
            .map_err(|_| StageError::Disconnected)
    }

    fn touch(
        &self,
        label: &'static str,
        x: f32,
        y: f32,
        op: fn(&mut RenderLoop, f32, f32) -> Result<(), StageError>,
    ) -> Result<(), StageError> {
        self.check(|| finite_point("touch point", x, y))?;
        self.queue
            .submit(self.context_tag(), label, move |stage| op(stage, x, y))
    }

    fn context_tag(&self) -> OpTag {
        OpTag::Context(self.shared.generation())
    }

    /// Runs a validation step, reporting a failure through the notification
    /// channel as well as to the caller.
    fn check<T>(
        &self,
        validate: impl FnOnce() -> Result<T, StageError>,
    ) -> Result<T, StageError> {
        validate().map_err(|err| {
            debug!(code = %err.code(), error = %err, "request rejected");
            self.notifier.error(&err);
            err
        })
    }

    fn dispatch<F>(
        &self,
        key: DispatchKey,
        tag: OpTag,
        label: &'static str,
        op: F,
    ) -> Result<Dispatch, StageError>
    where
        F: FnOnce(&mut RenderLoop) -> Result<(), StageError> + Send + 'static,
    {
        let Some(ticket) = self.shared.begin(&key) else {
            debug!(key = %key, "identical request already queued");
            return Ok(Dispatch::Deduplicated);
        };
        let guard = InFlight {
            shared: Arc::clone(&self.shared),
            key,
            ticket,
        };
        self.queue.submit(tag, label, move |stage| {
            let _guard = guard;
            op(stage)
        })?;
        Ok(Dispatch::Scheduled)
    }
}

fn non_empty(what: &'static str, value: &str) -> Result<(), StageError> {
    if value.trim().is_empty() {
        Err(StageError::validation(what, "may not be empty"))
    } else {
        Ok(())
    }
}

fn finite_point(what: &'static str, x: f32, y: f32) -> Result<(), StageError> {
    if x.is_finite() && y.is_finite() {
        Ok(())
    } else {
        Err(StageError::validation(what, format!("({x}, {y}) is not finite")))
    }
}

/// Normalises `input` to the canonical path of an existing, readable file.
fn resolve_model_path(input: &str) -> Result<PathBuf, StageError> {
    let source = ModelSource::from_input(input);
    let path = source.path();
    if path.as_os_str().is_empty() {
        return Err(StageError::validation("model path", "may not be empty"));
    }
    if !path.exists() {
        return Err(StageError::FileNotFound(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(StageError::validation(
            "model path",
            format!("{} is not a file", path.display()),
        ));
    }
    File::open(path).map_err(|err| {
        StageError::validation(
            "model path",
            format!("{} is not readable: {err}", path.display()),
        )
    })?;
    canonical(path)
}

fn canonical(path: &Path) -> Result<PathBuf, StageError> {
    path.canonicalize().map_err(|err| {
        StageError::validation(
            "model path",
            format!("{} cannot be resolved: {err}", path.display()),
        )
    })
}
