use std::thread::{self, ThreadId};

/// Identity of the thread that owns the graphics context. Everything holding
/// engine objects checks it before touching them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderThread {
    id: ThreadId,
}

impl RenderThread {
    /// Binds to the calling thread.
    pub fn current() -> Self {
        Self {
            id: thread::current().id(),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.id
    }

    #[track_caller]
    pub fn assert_current(&self, what: &str) {
        assert!(
            self.is_current(),
            "{what} accessed from {:?}; graphics resources belong to the render thread {:?}",
            thread::current().id(),
            self.id
        );
    }
}
