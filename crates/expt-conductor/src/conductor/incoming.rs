//! Consumer side of condition and result hand-offs

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::outgoing::Completeness;
use super::Shared;
use crate::environment::AnyValue;
use crate::error::{ConductorError, Result};
use crate::path::ExperimentPath;
use crate::state::{validate_incoming, IncomingState};
use crate::types::{ProductionKind, ProductionType};

/// Identity of one consumer's hand-off from one producer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct IncomingKey {
    pub(crate) consumer: ExperimentPath,
    pub(crate) producer: ExperimentPath,
    pub(crate) production: ProductionType,
    pub(crate) kind: ProductionKind,
}

impl IncomingKey {
    pub(crate) fn new(
        consumer: ExperimentPath,
        producer: ExperimentPath,
        production: ProductionType,
        kind: ProductionKind,
    ) -> Self {
        Self {
            consumer,
            producer,
            production,
            kind,
        }
    }

    /// Error returned once the hand-off is gone
    pub(crate) fn closed(&self) -> ConductorError {
        match self.kind {
            ProductionKind::Condition => ConductorError::ConditionClosed {
                producer: self.producer.clone(),
                production: self.production,
            },
            ProductionKind::Result => ConductorError::ResultClosed {
                producer: self.producer.clone(),
                production: self.production,
            },
        }
    }
}

/// Consumer state of one hand-off
#[derive(Debug, Clone)]
pub(crate) struct Incoming {
    state: IncomingState,
    outgoing_invalidated: bool,
}

impl Incoming {
    pub(crate) fn new(state: IncomingState) -> Self {
        Self {
            state,
            outgoing_invalidated: false,
        }
    }

    pub(crate) fn state(&self) -> IncomingState {
        self.state
    }

    pub(crate) fn is_outgoing_invalidated(&self) -> bool {
        self.outgoing_invalidated
    }

    /// Check if the consumer currently holds the production
    pub(crate) fn is_holding(&self) -> bool {
        self.state == IncomingState::Acquired && !self.outgoing_invalidated
    }

    /// Check if acquiring can never succeed
    pub(crate) fn is_closed(&self) -> bool {
        self.state == IncomingState::Done || self.outgoing_invalidated
    }

    pub(crate) fn acquire(&mut self) {
        self.transition(IncomingState::Acquired);
    }

    pub(crate) fn finish(&mut self) {
        self.transition(IncomingState::Done);
    }

    pub(crate) fn invalidate_outgoing(&mut self) {
        self.outgoing_invalidated = true;
    }

    /// Reset for a retry against a re-prepared producer
    pub(crate) fn reset(&mut self, state: IncomingState) {
        self.outgoing_invalidated = false;
        self.transition(state);
    }

    fn transition(&mut self, to: IncomingState) {
        match validate_incoming(self.state, to) {
            Ok(()) => self.state = to,
            Err(error) => tracing::error!(%error, "rejected hand-off transition"),
        }
    }
}

/// Block until the hand-off admits the consumer
///
/// Returns the supplied value for conditions and `None` for results, whose
/// values are read through the handle.
pub(crate) fn acquire(shared: &Shared, key: &IncomingKey, cancel: &AtomicBool) -> Result<Option<AnyValue>> {
    let mut state = shared.state.lock();
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(ConductorError::Interrupted(key.consumer.clone()));
        }
        match state.hand_offs.begin_acquire(key) {
            Admission::Admitted(value) => {
                tracing::debug!(
                    consumer = %key.consumer,
                    producer = %key.producer,
                    production = %key.production,
                    "acquired hand-off"
                );
                return Ok(value);
            }
            Admission::Closed => return Err(key.closed()),
            Admission::Wait(signal) => signal.wait(&mut state),
        }
    }
}

/// Outcome of one admission attempt
pub(crate) enum Admission {
    Admitted(Option<AnyValue>),
    Wait(Arc<parking_lot::Condvar>),
    Closed,
}

/// Consumer's hold on a condition
///
/// The condition is released by [`close`](Self::close) or on drop.
pub struct ConditionHandle<T> {
    shared: Arc<Shared>,
    key: IncomingKey,
    value: Arc<T>,
    cancel: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl<T> ConditionHandle<T> {
    pub(crate) fn new(shared: Arc<Shared>, key: IncomingKey, value: Arc<T>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            shared,
            key,
            value,
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    /// Producing instruction
    #[inline]
    #[must_use]
    pub fn producer(&self) -> &ExperimentPath {
        &self.key.producer
    }

    /// Condition value
    ///
    /// # Errors
    /// Returns [`ConductorError::ConditionClosed`] once the handle is closed
    /// or the producer is gone.
    pub fn value(&self) -> Result<Arc<T>> {
        if self.closed.load(Ordering::SeqCst) || !self.shared.state.lock().hand_offs.is_holding(&self.key) {
            return Err(self.key.closed());
        }
        Ok(Arc::clone(&self.value))
    }

    /// Release the condition to the next consumer
    pub fn close(&self) {
        close(&self.shared, &self.key, &self.closed, &self.cancel);
    }
}

impl<T> Drop for ConditionHandle<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for ConditionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionHandle")
            .field("producer", &self.key.producer)
            .field("production", &self.key.production)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Consumer's view of a result
///
/// Reads always return the latest observed value.
pub struct ResultHandle<T> {
    shared: Arc<Shared>,
    key: IncomingKey,
    cancel: Arc<AtomicBool>,
    closed: AtomicBool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ResultHandle<T> {
    pub(crate) fn new(shared: Arc<Shared>, key: IncomingKey, cancel: Arc<AtomicBool>) -> Self {
        Self {
            shared,
            key,
            cancel,
            closed: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    /// Producing instruction
    #[inline]
    #[must_use]
    pub fn producer(&self) -> &ExperimentPath {
        &self.key.producer
    }

    /// Completeness of the observed value
    ///
    /// # Errors
    /// Returns [`ConductorError::ResultClosed`] once the handle is closed or
    /// the producer is gone.
    pub fn completeness(&self) -> Result<Completeness> {
        let mut state = self.shared.state.lock();
        self.check_open(&state.hand_offs)?;
        state
            .hand_offs
            .result_mut(&self.key)
            .map(|result| result.completeness())
            .ok_or_else(|| self.key.closed())
    }

    /// Release the result
    pub fn close(&self) {
        close(&self.shared, &self.key, &self.closed, &self.cancel);
    }

    fn check_open(&self, hand_offs: &super::hand_off::HandOffs) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || !hand_offs.is_holding(&self.key) {
            return Err(self.key.closed());
        }
        Ok(())
    }
}

impl<T: Send + Sync + 'static> ResultHandle<T> {
    /// Latest observed value, `None` if the result was reset
    ///
    /// # Errors
    /// Returns [`ConductorError::ResultClosed`] once the handle is closed or
    /// the producer is gone.
    pub fn value(&self) -> Result<Option<Arc<T>>> {
        let mut state = self.shared.state.lock();
        self.check_open(&state.hand_offs)?;
        let value = state
            .hand_offs
            .result_mut(&self.key)
            .ok_or_else(|| self.key.closed())?
            .read();
        Ok(value.and_then(|value| value.downcast::<T>().ok()))
    }
}

impl<T> Drop for ResultHandle<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("producer", &self.key.producer)
            .field("production", &self.key.production)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Release a hand-off; a cancelled consumer is put back in line instead
/// of counting as done, so its restarted run can acquire again.
fn close(shared: &Shared, key: &IncomingKey, closed: &AtomicBool, cancel: &AtomicBool) {
    if closed.swap(true, Ordering::SeqCst) {
        return;
    }
    let mut state = shared.state.lock();
    if cancel.load(Ordering::SeqCst) {
        state.hand_offs.release_incoming(key);
        tracing::debug!(consumer = %key.consumer, producer = %key.producer, "released interrupted hand-off");
    } else {
        state.hand_offs.close_incoming(key);
        tracing::debug!(consumer = %key.consumer, producer = %key.producer, "closed hand-off");
    }
}
