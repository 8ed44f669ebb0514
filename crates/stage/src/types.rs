use std::fmt;
use std::path::PathBuf;

/// Graphics-context incarnation. Bumped every time a context becomes usable,
/// so work queued against an earlier context can be recognised and dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// Value before any context has been created.
    pub const INITIAL: Self = Self(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable id of one loaded model. Survives context recreation; a fresh id is
/// issued for every new load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelId(pub(crate) u64);

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Starting,
    Ready,
    ContextLost,
    Recreating,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::ContextLost => "context-lost",
            Self::Recreating => "recreating",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Host surface the embedding renders into, identified by whatever id the
/// host uses for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceRef {
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

impl SurfaceRef {
    pub fn new(id: u64, width: u32, height: u32) -> Self {
        Self { id, width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Callbacks a host delivers about its graphics surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceEvent {
    Created,
    Changed { width: u32, height: u32 },
    Lost,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MotionRef {
    pub group: String,
    pub index: usize,
}

impl MotionRef {
    pub fn new(group: impl Into<String>, index: usize) -> Self {
        Self {
            group: group.into(),
            index,
        }
    }
}

/// What has actually been applied to a model. Replayed onto the new engine
/// model after a context recreation.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelState {
    pub scale: f32,
    pub offset: (f32, f32),
    pub expression: Option<String>,
    pub motion: Option<MotionRef>,
}

impl Default for ModelState {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: (0.0, 0.0),
            expression: None,
            motion: None,
        }
    }
}

/// What callers have asked for, whether or not a model is loaded. Values that
/// were never set stay `None` and leave the model's own state alone.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredState {
    pub model_path: Option<PathBuf>,
    pub scale: Option<f32>,
    pub offset: Option<(f32, f32)>,
    pub expression: Option<String>,
    pub motion: Option<MotionRef>,
    pub auto_blink: bool,
    pub auto_breath: bool,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self {
            model_path: None,
            scale: None,
            offset: None,
            expression: None,
            motion: None,
            auto_blink: true,
            auto_breath: true,
        }
    }
}

impl DesiredState {
    pub fn overlay(&self, state: &ModelState) -> ModelState {
        ModelState {
            scale: self.scale.unwrap_or(state.scale),
            offset: self.offset.unwrap_or(state.offset),
            expression: self.expression.clone().or_else(|| state.expression.clone()),
            motion: self.motion.clone().or_else(|| state.motion.clone()),
        }
    }
}
