use std::path::PathBuf;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::trace;

use crate::error::{ErrorCode, StageError};

/// Events delivered to the host, asynchronously and in render-thread order.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    ModelLoaded { path: PathBuf },
    Error { code: ErrorCode, message: String },
    Tap { x: f32, y: f32 },
    MotionFinished { group: String, index: usize },
}

#[derive(Clone, Debug)]
pub(crate) struct Notifier {
    tx: Sender<Notification>,
}

impl Notifier {
    pub(crate) fn channel() -> (Self, Receiver<Notification>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub(crate) fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            trace!("notification dropped; host stopped listening");
        }
    }

    pub(crate) fn error(&self, err: &StageError) {
        self.send(Notification::Error {
            code: err.code(),
            message: err.to_string(),
        });
    }
}
