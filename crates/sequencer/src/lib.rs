use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use rand::prelude::*;
use settings::AnimationSettings;
use tracing::{debug, trace};

pub use settings::Priority;

#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("motion group '{0}' has no motions")]
    EmptyGroup(String),
    #[error("model defines no expressions")]
    NoExpressions,
}

/// The model a sequencer drives. Implemented by the render thread's model
/// wrapper; tests use an in-memory fake.
pub trait AnimationTarget {
    type Error: fmt::Display;

    fn start_motion(&mut self, request: &MotionRequest) -> Result<(), Self::Error>;

    /// Whether the engine's current motion has run to completion. Engines do
    /// not signal completion, so the sequencer polls this.
    fn motion_finished(&self) -> bool;

    fn apply_expression(&mut self, id: &str) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MotionRequest {
    pub group: String,
    pub index: usize,
    pub priority: Priority,
}

impl MotionRequest {
    pub fn new(group: impl Into<String>, index: usize, priority: Priority) -> Self {
        Self {
            group: group.into(),
            index,
            priority,
        }
    }
}

impl fmt::Display for MotionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.group, self.index, self.priority)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SequencerEvent {
    MotionStarted(MotionRequest),
    MotionQueued(MotionRequest),
    MotionEvicted(MotionRequest),
    MotionFinished(MotionRequest),
    MotionFailed {
        request: MotionRequest,
        message: String,
    },
    ExpressionApplied(String),
    ExpressionsSuperseded(Vec<String>),
    ExpressionFailed {
        id: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
}

/// Serializes motion and expression requests for one model.
///
/// Motions never overlap: while one plays, new requests wait in a bounded
/// FIFO that drops its oldest entry when full. Expressions are applied at
/// once when nothing is playing, otherwise held until the playing motion
/// completes; only the newest held expression survives.
pub struct AnimationSequencer {
    current: Option<MotionRequest>,
    motions: VecDeque<MotionRequest>,
    expressions: VecDeque<String>,
    motion_capacity: usize,
    expression_capacity: usize,
    poll_interval: Duration,
    last_poll: Option<Instant>,
    rng: StdRng,
}

impl AnimationSequencer {
    pub fn new(settings: &AnimationSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            current: None,
            motions: VecDeque::with_capacity(settings.motion_queue_capacity),
            expressions: VecDeque::with_capacity(settings.expression_queue_capacity),
            motion_capacity: settings.motion_queue_capacity.max(1),
            expression_capacity: settings.expression_queue_capacity.max(1),
            poll_interval: settings.poll_interval,
            last_poll: None,
            rng,
        }
    }

    pub fn state(&self) -> PlaybackState {
        if self.current.is_some() {
            PlaybackState::Playing
        } else {
            PlaybackState::Idle
        }
    }

    pub fn current(&self) -> Option<&MotionRequest> {
        self.current.as_ref()
    }

    pub fn queued_motions(&self) -> impl Iterator<Item = &MotionRequest> {
        self.motions.iter()
    }

    pub fn pending_expressions(&self) -> impl Iterator<Item = &str> {
        self.expressions.iter().map(String::as_str)
    }

    pub fn start_motion<T: AnimationTarget>(
        &mut self,
        target: &mut T,
        request: MotionRequest,
        now: Instant,
    ) -> Vec<SequencerEvent> {
        let mut events = Vec::new();
        if self.current.is_some() {
            if self.motions.len() >= self.motion_capacity {
                if let Some(evicted) = self.motions.pop_front() {
                    debug!(motion = %evicted, "motion queue full; evicting oldest request");
                    events.push(SequencerEvent::MotionEvicted(evicted));
                }
            }
            self.motions.push_back(request.clone());
            events.push(SequencerEvent::MotionQueued(request));
            return events;
        }

        self.begin(target, request, now, &mut events);
        if self.current.is_none() {
            self.flush_expressions(target, &mut events);
        }
        events
    }

    pub fn set_expression<T: AnimationTarget>(
        &mut self,
        target: &mut T,
        id: impl Into<String>,
    ) -> Vec<SequencerEvent> {
        let mut events = Vec::new();
        if self.expressions.len() >= self.expression_capacity {
            let superseded: Vec<String> = self.expressions.drain(..).collect();
            debug!(count = superseded.len(), "expression queue overflow; keeping newest only");
            events.push(SequencerEvent::ExpressionsSuperseded(superseded));
        }
        self.expressions.push_back(id.into());

        if self.current.is_none() {
            self.flush_expressions(target, &mut events);
        }
        events
    }

    /// Checks the playing motion at most once per poll interval. On
    /// completion the next queued motion starts before held expressions are
    /// flushed.
    pub fn poll<T: AnimationTarget>(
        &mut self,
        target: &mut T,
        now: Instant,
    ) -> Vec<SequencerEvent> {
        let mut events = Vec::new();
        let Some(playing) = self.current.as_ref() else {
            self.flush_expressions(target, &mut events);
            return events;
        };

        if let Some(last) = self.last_poll {
            if now.saturating_duration_since(last) < self.poll_interval {
                return events;
            }
        }
        self.last_poll = Some(now);

        if !target.motion_finished() {
            return events;
        }

        trace!(motion = %playing, "motion finished");
        if let Some(finished) = self.current.take() {
            events.push(SequencerEvent::MotionFinished(finished));
        }

        while self.current.is_none() {
            let Some(next) = self.motions.pop_front() else {
                break;
            };
            self.begin(target, next, now, &mut events);
        }
        self.flush_expressions(target, &mut events);
        events
    }

    /// Drops every queued request and forgets the playing motion without
    /// touching the target. Returns how many requests were discarded.
    pub fn cancel(&mut self) -> usize {
        let discarded =
            self.motions.len() + self.expressions.len() + usize::from(self.current.is_some());
        self.motions.clear();
        self.expressions.clear();
        self.current = None;
        self.last_poll = None;
        discarded
    }

    pub fn random_motion(
        &mut self,
        group: &str,
        count: usize,
        priority: Priority,
    ) -> Result<MotionRequest, SequencerError> {
        if count == 0 {
            return Err(SequencerError::EmptyGroup(group.to_string()));
        }
        let index = self.rng.gen_range(0..count);
        Ok(MotionRequest::new(group, index, priority))
    }

    pub fn random_expression<S: AsRef<str>>(
        &mut self,
        ids: &[S],
    ) -> Result<String, SequencerError> {
        ids.choose(&mut self.rng)
            .map(|id| id.as_ref().to_string())
            .ok_or(SequencerError::NoExpressions)
    }

    fn begin<T: AnimationTarget>(
        &mut self,
        target: &mut T,
        request: MotionRequest,
        now: Instant,
        events: &mut Vec<SequencerEvent>,
    ) {
        match target.start_motion(&request) {
            Ok(()) => {
                self.current = Some(request.clone());
                self.last_poll = Some(now);
                events.push(SequencerEvent::MotionStarted(request));
            }
            Err(err) => {
                events.push(SequencerEvent::MotionFailed {
                    request,
                    message: err.to_string(),
                });
            }
        }
    }

    fn flush_expressions<T: AnimationTarget>(
        &mut self,
        target: &mut T,
        events: &mut Vec<SequencerEvent>,
    ) {
        let Some(latest) = self.expressions.pop_back() else {
            return;
        };
        if !self.expressions.is_empty() {
            let superseded: Vec<String> = self.expressions.drain(..).collect();
            events.push(SequencerEvent::ExpressionsSuperseded(superseded));
        }
        match target.apply_expression(&latest) {
            Ok(()) => events.push(SequencerEvent::ExpressionApplied(latest)),
            Err(err) => events.push(SequencerEvent::ExpressionFailed {
                id: latest,
                message: err.to_string(),
            }),
        }
    }
}
