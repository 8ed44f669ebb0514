use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::engine::{EngineError, TextureId};

/// Whether the engine-side renderer of a model exists yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RendererAvailability {
    Pending,
    Available,
}

#[derive(Debug)]
struct PendingTexture {
    texture: TextureId,
    failures: u32,
    retry_at: u64,
}

#[derive(Debug, Default)]
struct Inner {
    slots: BTreeMap<usize, PendingTexture>,
    drains: u64,
}

/// Textures that exist on the GPU but are not bound to their model slot yet.
///
/// A failed bind stays pending and is retried on a later drain, with the wait
/// doubling per consecutive failure up to `max_backoff` drains.
#[derive(Debug)]
pub struct PendingTextureBinder {
    inner: Mutex<Inner>,
    max_backoff: u32,
}

impl PendingTextureBinder {
    pub fn new(max_backoff: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_backoff: max_backoff.max(1),
        }
    }

    /// Queues `texture` for `slot`, replacing anything already pending there.
    pub fn register(&self, slot: usize, texture: TextureId) {
        let mut inner = self.lock();
        let retry_at = inner.drains;
        inner.slots.insert(
            slot,
            PendingTexture {
                texture,
                failures: 0,
                retry_at,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn slots(&self) -> Vec<usize> {
        self.lock().slots.keys().copied().collect()
    }

    pub fn clear(&self) {
        self.lock().slots.clear();
    }

    /// Binds every due slot through `bind` and returns how many succeeded.
    /// Does nothing until the renderer is available.
    pub fn drain<F>(&self, renderer: RendererAvailability, mut bind: F) -> usize
    where
        F: FnMut(usize, TextureId) -> Result<(), EngineError>,
    {
        if renderer == RendererAvailability::Pending {
            return 0;
        }

        let mut inner = self.lock();
        let tick = inner.drains;
        inner.drains += 1;

        let mut bound = Vec::new();
        for (slot, pending) in inner.slots.iter_mut() {
            if pending.retry_at > tick {
                continue;
            }
            match bind(*slot, pending.texture) {
                Ok(()) => bound.push(*slot),
                Err(err) => {
                    pending.failures += 1;
                    let wait = backoff(pending.failures, self.max_backoff);
                    pending.retry_at = tick + wait;
                    if pending.failures == 1 {
                        warn!(slot = *slot, error = %err, "texture bind failed; will retry");
                    } else {
                        debug!(
                            slot = *slot,
                            failures = pending.failures,
                            retry_in = wait,
                            error = %err,
                            "texture bind failed again"
                        );
                    }
                }
            }
        }

        for slot in &bound {
            inner.slots.remove(slot);
        }
        bound.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn backoff(failures: u32, max: u32) -> u64 {
    let exponent = failures.saturating_sub(1).min(31);
    u64::from((1u32 << exponent).min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_textures_until_renderer_exists() {
        let binder = PendingTextureBinder::new(8);
        binder.register(0, TextureId(10));
        binder.register(1, TextureId(11));

        let mut calls = Vec::new();
        let bound = binder.drain(RendererAvailability::Pending, |slot, tex| {
            calls.push((slot, tex));
            Ok(())
        });
        assert_eq!(bound, 0);
        assert!(calls.is_empty());
        assert_eq!(binder.len(), 2);

        let bound = binder.drain(RendererAvailability::Available, |slot, tex| {
            calls.push((slot, tex));
            Ok(())
        });
        assert_eq!(bound, 2);
        assert_eq!(calls, vec![(0, TextureId(10)), (1, TextureId(11))]);
        assert!(binder.is_empty());
    }

    #[test]
    fn keeps_only_failed_slots() {
        let binder = PendingTextureBinder::new(8);
        for slot in 0..3 {
            binder.register(slot, TextureId(slot as u32));
        }

        let bound = binder.drain(RendererAvailability::Available, |slot, _| {
            if slot == 1 {
                Err(EngineError::new("slot busy"))
            } else {
                Ok(())
            }
        });
        assert_eq!(bound, 2);
        assert_eq!(binder.slots(), vec![1]);

        let bound = binder.drain(RendererAvailability::Available, |_, _| Ok(()));
        assert_eq!(bound, 1);
        assert!(binder.is_empty());
    }

    #[test]
    fn repeated_failures_back_off() {
        let binder = PendingTextureBinder::new(4);
        binder.register(0, TextureId(1));

        let mut attempts_per_drain = Vec::new();
        for _ in 0..12 {
            let mut attempts = 0;
            binder.drain(RendererAvailability::Available, |_, _| {
                attempts += 1;
                Err(EngineError::new("nope"))
            });
            attempts_per_drain.push(attempts);
        }

        // waits of 1, 2, 4, 4 drains between attempts
        assert_eq!(
            attempts_per_drain,
            vec![1, 1, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1]
        );
        assert_eq!(binder.len(), 1);
    }

    #[test]
    fn re_registering_resets_backoff() {
        let binder = PendingTextureBinder::new(64);
        binder.register(0, TextureId(1));
        for _ in 0..3 {
            binder.drain(RendererAvailability::Available, |_, _| {
                Err(EngineError::new("nope"))
            });
        }

        binder.register(0, TextureId(2));
        let mut seen = None;
        let bound = binder.drain(RendererAvailability::Available, |_, tex| {
            seen = Some(tex);
            Ok(())
        });
        assert_eq!(bound, 1);
        assert_eq!(seen, Some(TextureId(2)));
    }
}
