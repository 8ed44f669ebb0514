//! Embeds a deformable 2D model engine behind a thread-safe command surface.
//!
//! Callers on any thread talk to a [`StageHandle`]; everything that touches
//! the graphics context runs on one render thread owned by [`RenderLoop`]
//! (usually driven by [`StageRuntime`]).
//!
//! ```text
//!  caller threads                     render thread
//!  ──────────────                     ─────────────
//!  StageHandle ── validate, dedup,
//!       │         record desired
//!       ▼
//!  CommandQueue ──(generation tag)──▶ RenderLoop::pump ──▶ ResourceLifecycle
//!                                          │                 ├─ ModelCollection
//!  surface events ───────────────────▶     │                 └─ TextureManager
//!                                          ▼
//!  Notification ◀───────────────────  AnimationSequencer, PendingTextureBinder,
//!                                     RenderEngine / EngineModel
//! ```
//!
//! Operations issued against a graphics context that has since been lost are
//! dropped when they reach the render thread; the caller's desired state is
//! replayed onto rebuilt models instead.
mod binder;
mod dispatcher;
mod engine;
mod error;
mod guard;
mod lifecycle;
mod model;
mod notify;
mod queue;
mod render;
mod runtime;
mod shared;
mod textures;
mod types;
mod view;

#[cfg(test)]
mod testing;

pub use binder::{PendingTextureBinder, RendererAvailability};
pub use dispatcher::{Dispatch, DispatchKey, StageHandle};
pub use engine::{EngineError, EngineFactory, EngineModel, RenderEngine, TextureId};
pub use error::{ErrorCode, StageError};
pub use guard::RenderThread;
pub use notify::Notification;
pub use queue::{CommandQueue, OpTag, PumpReport, RenderOp};
pub use render::RenderLoop;
pub use runtime::{FramePacer, StageRuntime};
pub use types::{
    DesiredState, Generation, LifecycleState, ModelId, ModelState, MotionRef, SurfaceEvent,
    SurfaceRef,
};
pub use view::{TouchTracker, ViewTransform};

pub use sequencer::{PlaybackState, Priority};
pub use settings::StageSettings;
