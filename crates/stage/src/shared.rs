use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::dispatcher::{DispatchFamily, DispatchKey};
use crate::types::{DesiredState, Generation, LifecycleState};

/// State both sides of the queue read: the render thread publishes what is
/// live, callers record what they want.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    generation: AtomicU64,
    lifecycle: Mutex<LifecycleState>,
    active_model: Mutex<Option<PathBuf>>,
    desired: Mutex<DesiredState>,
    in_flight: Mutex<InFlightTable>,
    mouth: AtomicU32,
}

/// Newest queued request per family, tagged with the ticket it was queued
/// under, plus the number of requests still queued.
#[derive(Debug, Default)]
struct InFlightTable {
    newest: HashMap<DispatchFamily, (DispatchKey, u64)>,
    next_ticket: u64,
    outstanding: usize,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SharedState {
    pub(crate) fn generation(&self) -> Generation {
        Generation::from_raw(self.generation.load(Ordering::SeqCst))
    }

    pub(crate) fn lifecycle_state(&self) -> LifecycleState {
        *lock(&self.lifecycle)
    }

    pub(crate) fn active_model(&self) -> Option<PathBuf> {
        lock(&self.active_model).clone()
    }

    pub(crate) fn publish(
        &self,
        state: LifecycleState,
        generation: Generation,
        active: Option<PathBuf>,
    ) {
        *lock(&self.lifecycle) = state;
        *lock(&self.active_model) = active;
        self.generation.store(generation.value(), Ordering::SeqCst);
    }

    pub(crate) fn desired(&self) -> DesiredState {
        lock(&self.desired).clone()
    }

    pub(crate) fn update_desired<R>(&self, update: impl FnOnce(&mut DesiredState) -> R) -> R {
        update(&mut lock(&self.desired))
    }

    /// Claims a ticket for `key`. `None` when the newest queued request of
    /// the same family is identical; an older identical request with a
    /// different one queued after it does not count.
    pub(crate) fn begin(&self, key: &DispatchKey) -> Option<u64> {
        let mut table = lock(&self.in_flight);
        let family = key.family();
        if table
            .newest
            .get(&family)
            .is_some_and(|(newest, _)| newest == key)
        {
            return None;
        }
        table.next_ticket += 1;
        let ticket = table.next_ticket;
        table.newest.insert(family, (key.clone(), ticket));
        table.outstanding += 1;
        Some(ticket)
    }

    pub(crate) fn finish(&self, key: &DispatchKey, ticket: u64) {
        let mut table = lock(&self.in_flight);
        table.outstanding = table.outstanding.saturating_sub(1);
        let family = key.family();
        if table
            .newest
            .get(&family)
            .is_some_and(|(_, newest)| *newest == ticket)
        {
            table.newest.remove(&family);
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        lock(&self.in_flight).outstanding
    }

    pub(crate) fn mouth(&self) -> f32 {
        f32::from_bits(self.mouth.load(Ordering::Relaxed))
    }

    pub(crate) fn set_mouth(&self, value: f32) {
        self.mouth.store(value.to_bits(), Ordering::Relaxed);
    }
}
