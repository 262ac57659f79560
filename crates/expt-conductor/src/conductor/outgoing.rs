//! Producer side of condition and result hand-offs
//!
//! Each production of an instruction owns one outgoing object with its own
//! condition variable. All fields are guarded by the conductor's state lock;
//! the condition variable is always waited on with that lock.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Condvar;

use super::incoming::{Incoming, IncomingKey};
use crate::environment::AnyValue;
use crate::state::IncomingState;
use crate::types::Evaluation;

/// Lazily evaluated value source
pub(crate) type ValueSupplier = Arc<dyn Fn() -> AnyValue + Send + Sync>;

/// Completeness of an observed result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Completeness {
    /// No value observed yet
    Empty,
    /// A value is observed and may still change
    Partial,
    /// The value is final
    Complete,
}

/// Registered consumers of one production
pub(crate) struct Consumers {
    keys: IndexSet<IncomingKey>,
    acquired: Vec<IncomingKey>,
    terminated: bool,
    signal: Arc<Condvar>,
}

impl Consumers {
    fn new() -> Self {
        Self {
            keys: IndexSet::new(),
            acquired: Vec::new(),
            terminated: false,
            signal: Arc::new(Condvar::new()),
        }
    }

    pub(crate) fn signal(&self) -> Arc<Condvar> {
        Arc::clone(&self.signal)
    }

    pub(crate) fn notify(&self) {
        self.signal.notify_all();
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &IncomingKey> {
        self.keys.iter()
    }

    pub(crate) fn contains(&self, key: &IncomingKey) -> bool {
        self.keys.contains(key)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Replace the registered set, keeping the given order
    pub(crate) fn replace(&mut self, keys: IndexSet<IncomingKey>) {
        self.acquired.retain(|key| keys.contains(key));
        self.keys = keys;
    }

    /// Forget a previous admission so the consumer can acquire again
    pub(crate) fn readmit(&mut self, key: &IncomingKey) {
        self.acquired.retain(|acquired| acquired != key);
    }

    fn all_acquired_done(&self, incoming: &HashMap<IncomingKey, Incoming>) -> bool {
        self.acquired
            .iter()
            .all(|key| incoming.get(key).map_or(true, |i| i.state() == IncomingState::Done))
    }

    /// First registered consumer that is neither admitted nor finished
    fn next_consumer(&self, incoming: &HashMap<IncomingKey, Incoming>) -> Option<&IncomingKey> {
        self.keys.iter().find(|key| {
            !self.acquired.contains(key)
                && incoming
                    .get(*key)
                    .is_some_and(|i| i.state() != IncomingState::Done)
        })
    }

    fn all_done(&self, incoming: &HashMap<IncomingKey, Incoming>) -> bool {
        self.keys
            .iter()
            .all(|key| incoming.get(key).map_or(true, |i| i.state() == IncomingState::Done))
    }

    fn invalidate(&mut self, incoming: &mut HashMap<IncomingKey, Incoming>) {
        for key in self.keys.drain(..) {
            if let Some(entry) = incoming.get_mut(&key) {
                entry.invalidate_outgoing();
            }
        }
        self.acquired.clear();
        self.terminated = false;
        self.notify();
    }

    fn terminate(&mut self, incoming: &mut HashMap<IncomingKey, Incoming>, close: bool) {
        self.terminated = true;
        if close {
            for key in &self.keys {
                if let Some(entry) = incoming.get_mut(key) {
                    entry.finish();
                }
            }
        }
        self.notify();
    }
}

/// Producer side of a condition
pub(crate) struct OutgoingCondition {
    evaluation: Evaluation,
    resource: Option<ValueSupplier>,
    consumers: Consumers,
}

impl OutgoingCondition {
    pub(crate) fn new(evaluation: Evaluation) -> Self {
        Self {
            evaluation,
            resource: None,
            consumers: Consumers::new(),
        }
    }

    pub(crate) fn evaluation(&self) -> Evaluation {
        self.evaluation
    }

    pub(crate) fn set_evaluation(&mut self, evaluation: Evaluation) {
        self.evaluation = evaluation;
    }

    pub(crate) fn consumers(&self) -> &Consumers {
        &self.consumers
    }

    pub(crate) fn consumers_mut(&mut self) -> &mut Consumers {
        &mut self.consumers
    }

    /// Initial state of a newly registered consumer
    pub(crate) fn fresh_state(&self) -> IncomingState {
        if self.consumers.terminated {
            IncomingState::Done
        } else {
            IncomingState::Waiting
        }
    }

    pub(crate) fn is_prepared(&self) -> bool {
        self.resource.is_some()
    }

    /// Make the resource available; false if a preparation is in flight
    pub(crate) fn begin_prepare(&mut self, supplier: ValueSupplier) -> bool {
        if self.resource.is_some() {
            return false;
        }
        self.resource = Some(supplier);
        self.consumers.notify();
        true
    }

    pub(crate) fn end_prepare(&mut self) {
        self.resource = None;
        self.consumers.notify();
    }

    /// Check if every registered consumer is DONE
    pub(crate) fn is_drained(&self, incoming: &HashMap<IncomingKey, Incoming>) -> bool {
        self.consumers.all_done(incoming)
    }

    /// Try to admit a consumer, returning its value on admission
    pub(crate) fn begin_acquire(
        &mut self,
        key: &IncomingKey,
        incoming: &HashMap<IncomingKey, Incoming>,
    ) -> Option<AnyValue> {
        let supplier = self.resource.as_ref()?;
        if !self.consumers.contains(key) {
            return None;
        }
        let admitted = match self.evaluation {
            Evaluation::Ordered => {
                self.consumers.all_acquired_done(incoming)
                    && self.consumers.next_consumer(incoming) == Some(key)
            }
            Evaluation::Serial | Evaluation::SerialTogether => {
                self.consumers.all_acquired_done(incoming)
            }
            Evaluation::Parallel | Evaluation::ParallelTogether | Evaluation::Independent => true,
        };
        if !admitted {
            return None;
        }
        let value = supplier();
        self.consumers.acquired.push(key.clone());
        Some(value)
    }

    /// Value for a consumer that already holds the condition
    pub(crate) fn reacquire(&self) -> Option<AnyValue> {
        self.resource.as_ref().map(|supplier| supplier())
    }

    pub(crate) fn invalidate(&mut self, incoming: &mut HashMap<IncomingKey, Incoming>) {
        self.resource = None;
        self.consumers.invalidate(incoming);
    }

    pub(crate) fn terminate(&mut self, incoming: &mut HashMap<IncomingKey, Incoming>) {
        self.resource = None;
        self.consumers.terminate(incoming, true);
    }
}

/// Observed value of a result
#[derive(Default)]
pub(crate) struct ResultValue {
    supplier: Option<ValueSupplier>,
    cached: Option<AnyValue>,
    complete: bool,
}

impl ResultValue {
    fn has_value(&self) -> bool {
        self.supplier.is_some() || self.cached.is_some()
    }

    fn completeness(&self) -> Completeness {
        match (self.has_value(), self.complete) {
            (false, _) => Completeness::Empty,
            (true, false) => Completeness::Partial,
            (true, true) => Completeness::Complete,
        }
    }

    /// Current value, evaluating a pending supplier once
    fn read(&mut self) -> Option<AnyValue> {
        if let Some(supplier) = self.supplier.take() {
            self.cached = Some(supplier());
        }
        self.cached.clone()
    }
}

/// Producer side of a result
pub(crate) struct OutgoingResult {
    value: ResultValue,
    consumers: Consumers,
}

impl OutgoingResult {
    pub(crate) fn new() -> Self {
        Self {
            value: ResultValue::default(),
            consumers: Consumers::new(),
        }
    }

    pub(crate) fn consumers(&self) -> &Consumers {
        &self.consumers
    }

    pub(crate) fn consumers_mut(&mut self) -> &mut Consumers {
        &mut self.consumers
    }

    /// Initial state of a newly registered consumer
    ///
    /// A terminated result stays readable while it holds a value.
    pub(crate) fn fresh_state(&self) -> IncomingState {
        if self.consumers.terminated && !self.value.has_value() {
            IncomingState::Done
        } else {
            IncomingState::Waiting
        }
    }

    pub(crate) fn completeness(&self) -> Completeness {
        self.value.completeness()
    }

    pub(crate) fn read(&mut self) -> Option<AnyValue> {
        self.value.read()
    }

    /// Observe a new partial value
    pub(crate) fn observe_partial(&mut self, supplier: ValueSupplier) {
        self.value.supplier = Some(supplier);
        self.value.cached = None;
        self.value.complete = false;
        self.consumers.notify();
    }

    pub(crate) fn complete(&mut self) {
        self.value.complete = true;
        self.consumers.notify();
    }

    /// Any registered consumer is admitted once a value exists
    pub(crate) fn begin_acquire(&mut self, key: &IncomingKey) -> bool {
        if !self.value.has_value() || !self.consumers.contains(key) {
            return false;
        }
        if !self.consumers.acquired.contains(key) {
            self.consumers.acquired.push(key.clone());
        }
        true
    }

    pub(crate) fn invalidate(&mut self, incoming: &mut HashMap<IncomingKey, Incoming>) {
        self.value = ResultValue::default();
        self.consumers.invalidate(incoming);
    }

    /// Seal the result; consumers are closed only if nothing was observed
    pub(crate) fn terminate(&mut self, incoming: &mut HashMap<IncomingKey, Incoming>) {
        let observed = self.value.has_value();
        if observed {
            self.value.complete = true;
        }
        self.consumers.terminate(incoming, !observed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ExperimentPath;
    use crate::types::{ProductionKind, ProductionType};

    fn key(consumer: &str) -> IncomingKey {
        IncomingKey::new(
            consumer.parse().unwrap(),
            "/holder".parse::<ExperimentPath>().unwrap(),
            ProductionType::of::<u32>(),
            ProductionKind::Condition,
        )
    }

    fn setup(evaluation: Evaluation, consumers: &[&str]) -> (OutgoingCondition, HashMap<IncomingKey, Incoming>, Vec<IncomingKey>) {
        let mut outgoing = OutgoingCondition::new(evaluation);
        let keys: Vec<_> = consumers.iter().map(|c| key(c)).collect();
        let incoming = keys
            .iter()
            .map(|k| (k.clone(), Incoming::new(IncomingState::Waiting)))
            .collect();
        outgoing.consumers_mut().replace(keys.iter().cloned().collect());
        assert!(outgoing.begin_prepare(Arc::new(|| Arc::new(7_u32) as AnyValue)));
        (outgoing, incoming, keys)
    }

    fn admit(
        outgoing: &mut OutgoingCondition,
        incoming: &mut HashMap<IncomingKey, Incoming>,
        key: &IncomingKey,
    ) -> bool {
        let admitted = outgoing.begin_acquire(key, incoming).is_some();
        if admitted {
            incoming.get_mut(key).unwrap().acquire();
        }
        admitted
    }

    #[test]
    fn test_ordered_admits_in_declaration_order() {
        let (mut outgoing, mut incoming, keys) = setup(Evaluation::Ordered, &["/holder/a", "/holder/b", "/holder/c"]);
        assert!(!admit(&mut outgoing, &mut incoming, &keys[2]));
        assert!(!admit(&mut outgoing, &mut incoming, &keys[1]));
        assert!(admit(&mut outgoing, &mut incoming, &keys[0]));
        assert!(!admit(&mut outgoing, &mut incoming, &keys[1]));

        incoming.get_mut(&keys[0]).unwrap().finish();
        assert!(!admit(&mut outgoing, &mut incoming, &keys[2]));
        assert!(admit(&mut outgoing, &mut incoming, &keys[1]));
        incoming.get_mut(&keys[1]).unwrap().finish();
        assert!(admit(&mut outgoing, &mut incoming, &keys[2]));
        incoming.get_mut(&keys[2]).unwrap().finish();
        assert!(outgoing.is_drained(&incoming));
    }

    #[test]
    fn test_ordered_skips_consumers_that_finished_without_acquiring() {
        let (mut outgoing, mut incoming, keys) = setup(Evaluation::Ordered, &["/holder/a", "/holder/b"]);
        incoming.get_mut(&keys[0]).unwrap().finish();
        assert!(admit(&mut outgoing, &mut incoming, &keys[1]));
    }

    #[test]
    fn test_serial_admits_any_order_without_overlap() {
        let (mut outgoing, mut incoming, keys) = setup(Evaluation::Serial, &["/holder/a", "/holder/b"]);
        assert!(admit(&mut outgoing, &mut incoming, &keys[1]));
        assert!(!admit(&mut outgoing, &mut incoming, &keys[0]));
        incoming.get_mut(&keys[1]).unwrap().finish();
        assert!(admit(&mut outgoing, &mut incoming, &keys[0]));
    }

    #[test]
    fn test_parallel_together_admits_everyone() {
        let (mut outgoing, mut incoming, keys) =
            setup(Evaluation::ParallelTogether, &["/holder/a", "/holder/b", "/holder/c"]);
        for key in &keys {
            assert!(admit(&mut outgoing, &mut incoming, key));
        }
        assert!(!outgoing.is_drained(&incoming));
    }

    #[test]
    fn test_nothing_admitted_without_resource() {
        let (mut outgoing, mut incoming, keys) = setup(Evaluation::Independent, &["/holder/a"]);
        outgoing.end_prepare();
        assert!(!admit(&mut outgoing, &mut incoming, &keys[0]));
        assert!(!outgoing.is_prepared());
    }

    #[test]
    fn test_prepare_is_not_reentrant() {
        let (mut outgoing, _incoming, _keys) = setup(Evaluation::Independent, &["/holder/a"]);
        assert!(!outgoing.begin_prepare(Arc::new(|| Arc::new(8_u32) as AnyValue)));
    }

    #[test]
    fn test_invalidate_marks_consumers() {
        let (mut outgoing, mut incoming, keys) = setup(Evaluation::Serial, &["/holder/a", "/holder/b"]);
        outgoing.invalidate(&mut incoming);
        assert!(incoming.values().all(Incoming::is_outgoing_invalidated));
        assert_eq!(outgoing.consumers().keys().count(), 0);
        assert!(outgoing.begin_acquire(&keys[0], &incoming).is_none());
    }

    #[test]
    fn test_terminate_closes_conditions() {
        let (mut outgoing, mut incoming, _keys) = setup(Evaluation::Serial, &["/holder/a", "/holder/b"]);
        outgoing.terminate(&mut incoming);
        assert!(incoming.values().all(|i| i.state() == IncomingState::Done));
        assert_eq!(outgoing.fresh_state(), IncomingState::Done);
    }

    #[test]
    fn test_terminated_result_stays_readable() {
        let mut result = OutgoingResult::new();
        let mut incoming = HashMap::new();
        assert_eq!(result.completeness(), Completeness::Empty);

        result.observe_partial(Arc::new(|| Arc::new(1_u32) as AnyValue));
        assert_eq!(result.completeness(), Completeness::Partial);
        result.terminate(&mut incoming);
        assert_eq!(result.completeness(), Completeness::Complete);
        assert_eq!(result.fresh_state(), IncomingState::Waiting);
        let value = result.read().unwrap().downcast::<u32>().unwrap();
        assert_eq!(*value, 1);

        let mut empty = OutgoingResult::new();
        empty.terminate(&mut incoming);
        assert_eq!(empty.fresh_state(), IncomingState::Done);
    }
}
