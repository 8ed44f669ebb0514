//! Single ingress for work that touches graphics state. Any thread may
//! submit; only the render thread drains, in submission order.
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{ErrorCode, StageError};
use crate::render::RenderLoop;
use crate::types::Generation;

pub type RenderOp = Box<dyn FnOnce(&mut RenderLoop) -> Result<(), StageError> + Send>;

/// Which context an operation was issued against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpTag {
    /// Runs only while the context generation still matches.
    Context(Generation),
    /// Lifecycle commands run regardless of generation.
    Lifecycle,
}

pub(crate) struct QueuedOp {
    pub(crate) tag: OpTag,
    pub(crate) label: &'static str,
    pub(crate) op: RenderOp,
}

/// Submitting half, cheap to clone into any caller thread.
#[derive(Clone)]
pub struct CommandQueue {
    tx: Sender<QueuedOp>,
}

pub(crate) struct CommandReceiver {
    rx: Receiver<QueuedOp>,
}

pub(crate) fn command_queue() -> (CommandQueue, CommandReceiver) {
    let (tx, rx) = unbounded();
    (CommandQueue { tx }, CommandReceiver { rx })
}

impl CommandQueue {
    /// Appends `op`; never blocks. Fails only once the render loop is gone.
    pub fn submit<F>(&self, tag: OpTag, label: &'static str, op: F) -> Result<(), StageError>
    where
        F: FnOnce(&mut RenderLoop) -> Result<(), StageError> + Send + 'static,
    {
        self.tx
            .send(QueuedOp {
                tag,
                label,
                op: Box::new(op),
            })
            .map_err(|_| StageError::Disconnected)
    }
}

impl CommandReceiver {
    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn try_next(&self) -> Option<QueuedOp> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn receiver(&self) -> &Receiver<QueuedOp> {
        &self.rx
    }
}

/// Outcome counts of one drain of the queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub executed: usize,
    pub skipped_stale: usize,
    pub failed: usize,
}

/// Runs `f`, turning a panic into an engine error so one misbehaving
/// collaborator cannot take the render thread down.
pub(crate) fn run_guarded<T>(
    label: &str,
    f: impl FnOnce() -> Result<T, StageError>,
) -> Result<T, StageError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(StageError::EngineOperation {
            operation: label.to_string(),
            code: ErrorCode::EngineError,
            message: format!("panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
