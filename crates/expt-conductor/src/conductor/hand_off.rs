//! Hand-off arena
//!
//! Every outgoing and incoming object of the live procedure is stored here,
//! keyed by producer, production and consumer. The arena lives inside the
//! conductor state and is only touched under the state lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Condvar;

use super::incoming::{Admission, Incoming, IncomingKey};
use super::outgoing::{OutgoingCondition, OutgoingResult, ValueSupplier};
use crate::error::{ConductorError, Result};
use crate::path::ExperimentPath;
use crate::planning::ProcedureDependents;
use crate::procedure::Procedure;
use crate::state::IncomingState;
use crate::types::{ProductionKind, ProductionType};

/// Identity of one production of one instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct OutgoingKey {
    pub(crate) producer: ExperimentPath,
    pub(crate) production: ProductionType,
}

impl OutgoingKey {
    pub(crate) fn new(producer: ExperimentPath, production: ProductionType) -> Self {
        Self { producer, production }
    }
}

impl From<&IncomingKey> for OutgoingKey {
    fn from(key: &IncomingKey) -> Self {
        Self::new(key.producer.clone(), key.production)
    }
}

/// Outgoing and incoming objects of the live procedure
#[derive(Default)]
pub(crate) struct HandOffs {
    conditions: HashMap<OutgoingKey, OutgoingCondition>,
    results: HashMap<OutgoingKey, OutgoingResult>,
    incoming: HashMap<IncomingKey, Incoming>,
}

impl HandOffs {
    /// Try to admit a consumer under the producer's policy
    pub(crate) fn begin_acquire(&mut self, key: &IncomingKey) -> Admission {
        let Some(entry) = self.incoming.get(key) else {
            return Admission::Closed;
        };
        if entry.is_closed() {
            return Admission::Closed;
        }
        let holding = entry.state() == IncomingState::Acquired;
        let outgoing_key = OutgoingKey::from(key);

        let (admitted, signal) = match key.kind {
            ProductionKind::Condition => {
                let Some(outgoing) = self.conditions.get_mut(&outgoing_key) else {
                    return Admission::Closed;
                };
                let value = if holding {
                    outgoing.reacquire()
                } else {
                    outgoing.begin_acquire(key, &self.incoming)
                };
                match value {
                    Some(value) => (Some(Some(value)), outgoing.consumers().signal()),
                    None => (None, outgoing.consumers().signal()),
                }
            }
            ProductionKind::Result => {
                let Some(outgoing) = self.results.get_mut(&outgoing_key) else {
                    return Admission::Closed;
                };
                let admitted = outgoing.begin_acquire(key);
                (admitted.then_some(None), outgoing.consumers().signal())
            }
        };

        match admitted {
            Some(value) => {
                if !holding {
                    if let Some(entry) = self.incoming.get_mut(key) {
                        entry.acquire();
                    }
                }
                Admission::Admitted(value)
            }
            None => Admission::Wait(signal),
        }
    }

    /// Check if a consumer currently holds its hand-off
    pub(crate) fn is_holding(&self, key: &IncomingKey) -> bool {
        self.incoming.get(key).is_some_and(Incoming::is_holding)
    }

    #[cfg(test)]
    pub(crate) fn incoming_state(&self, key: &IncomingKey) -> Option<IncomingState> {
        self.incoming.get(key).map(Incoming::state)
    }

    pub(crate) fn result_mut(&mut self, key: &IncomingKey) -> Option<&mut OutgoingResult> {
        self.results.get_mut(&OutgoingKey::from(key))
    }

    /// Consumer finished with its hand-off
    pub(crate) fn close_incoming(&mut self, key: &IncomingKey) {
        if let Some(entry) = self.incoming.get_mut(key) {
            entry.finish();
        }
        self.notify(key);
    }

    /// Make a condition available to its consumers
    ///
    /// # Errors
    /// Returns [`ConductorError::UndeclaredProduction`] for an unknown
    /// condition and [`ConductorError::IllegalPrepare`] while a previous
    /// preparation has not drained.
    pub(crate) fn begin_prepare(&mut self, key: &OutgoingKey, supplier: ValueSupplier) -> Result<Arc<Condvar>> {
        let outgoing = self
            .conditions
            .get_mut(key)
            .ok_or(ConductorError::UndeclaredProduction(key.production))?;
        if !outgoing.begin_prepare(supplier) {
            return Err(ConductorError::IllegalPrepare(key.production));
        }
        tracing::debug!(
            producer = %key.producer,
            production = %key.production,
            evaluation = %outgoing.evaluation(),
            "prepared condition"
        );
        Ok(outgoing.consumers().signal())
    }

    /// Check if every consumer of a condition is DONE
    pub(crate) fn is_drained(&self, key: &OutgoingKey) -> bool {
        self.conditions
            .get(key)
            .map_or(true, |outgoing| outgoing.is_drained(&self.incoming))
    }

    pub(crate) fn end_prepare(&mut self, key: &OutgoingKey) {
        if let Some(outgoing) = self.conditions.get_mut(key) {
            outgoing.end_prepare();
        }
    }

    /// Observe a new value of a result
    ///
    /// # Errors
    /// Returns [`ConductorError::UndeclaredProduction`] for an unknown result.
    pub(crate) fn observe_partial(&mut self, key: &OutgoingKey, supplier: ValueSupplier) -> Result<()> {
        self.results
            .get_mut(key)
            .ok_or(ConductorError::UndeclaredProduction(key.production))?
            .observe_partial(supplier);
        Ok(())
    }

    /// Mark a result complete
    ///
    /// # Errors
    /// Returns [`ConductorError::UndeclaredProduction`] for an unknown result.
    pub(crate) fn complete_result(&mut self, key: &OutgoingKey) -> Result<()> {
        self.results
            .get_mut(key)
            .ok_or(ConductorError::UndeclaredProduction(key.production))?
            .complete();
        Ok(())
    }

    /// Producer completed: close conditions and seal results
    pub(crate) fn terminate_outgoing(&mut self, producer: &ExperimentPath) {
        for (key, outgoing) in &mut self.conditions {
            if &key.producer == producer {
                outgoing.terminate(&mut self.incoming);
            }
        }
        for (key, outgoing) in &mut self.results {
            if &key.producer == producer {
                outgoing.terminate(&mut self.incoming);
            }
        }
    }

    /// Consumer completed: every hand-off it holds or awaits is DONE
    pub(crate) fn finish_incoming(&mut self, consumer: &ExperimentPath) {
        let keys = self.incoming_keys(consumer);
        for key in &keys {
            if let Some(entry) = self.incoming.get_mut(key) {
                entry.finish();
            }
            self.notify(key);
        }
    }

    /// Producer invalidated: consumers may no longer acquire
    pub(crate) fn invalidate_outgoing(&mut self, producer: &ExperimentPath) {
        for (key, outgoing) in &mut self.conditions {
            if &key.producer == producer {
                outgoing.invalidate(&mut self.incoming);
            }
        }
        for (key, outgoing) in &mut self.results {
            if &key.producer == producer {
                outgoing.invalidate(&mut self.incoming);
            }
        }
        tracing::debug!(%producer, "invalidated outgoing hand-offs");
    }

    /// Consumer invalidated: reset its hand-offs so a new run can retry
    pub(crate) fn invalidate_incoming(&mut self, consumer: &ExperimentPath) {
        for key in self.incoming_keys(consumer) {
            self.release_incoming(&key);
        }
    }

    /// Put one hand-off back in line without counting it as done
    pub(crate) fn release_incoming(&mut self, key: &IncomingKey) {
        let outgoing_key = OutgoingKey::from(key);
        let fresh = match key.kind {
            ProductionKind::Condition => self.conditions.get_mut(&outgoing_key).map(|outgoing| {
                outgoing.consumers_mut().readmit(key);
                outgoing.consumers().notify();
                outgoing.fresh_state()
            }),
            ProductionKind::Result => self.results.get_mut(&outgoing_key).map(|outgoing| {
                outgoing.consumers_mut().readmit(key);
                outgoing.consumers().notify();
                outgoing.fresh_state()
            }),
        };
        if let Some(entry) = self.incoming.get_mut(key) {
            match fresh {
                Some(state) if !entry.is_outgoing_invalidated() => entry.reset(state),
                _ => entry.finish(),
            }
        }
    }

    /// Instructions registered as consumers of a producer
    pub(crate) fn consumers_of(&self, producer: &ExperimentPath) -> Vec<ExperimentPath> {
        let conditions = self
            .conditions
            .iter()
            .filter(|(key, _)| &key.producer == producer)
            .flat_map(|(_, outgoing)| outgoing.consumers().keys());
        let results = self
            .results
            .iter()
            .filter(|(key, _)| &key.producer == producer)
            .flat_map(|(_, outgoing)| outgoing.consumers().keys());
        let consumers: IndexSet<ExperimentPath> = conditions.chain(results).map(|key| key.consumer.clone()).collect();
        consumers.into_iter().collect()
    }

    /// Wake every waiter whose hand-off involves an instruction
    pub(crate) fn notify_involving(&self, path: &ExperimentPath) {
        for (key, outgoing) in &self.conditions {
            if &key.producer == path || outgoing.consumers().keys().any(|k| &k.consumer == path) {
                outgoing.consumers().notify();
            }
        }
        for (key, outgoing) in &self.results {
            if &key.producer == path || outgoing.consumers().keys().any(|k| &k.consumer == path) {
                outgoing.consumers().notify();
            }
        }
    }

    /// Match the arena to a newly planned procedure
    ///
    /// Outgoing objects are created for new productions and invalidated for
    /// dropped ones. Consumer sets follow declaration order. Invalidated
    /// incoming objects are reset so their consumers can retry.
    pub(crate) fn rewire(&mut self, procedure: &Procedure, dependents: &ProcedureDependents) {
        let mut live_conditions = HashSet::new();
        let mut live_results = HashSet::new();
        let mut wanted = HashSet::new();

        for path in procedure.paths() {
            let Some(produced) = dependents.dependents(path) else {
                continue;
            };
            for (production, condition) in produced.conditions() {
                let key = OutgoingKey::new(path.clone(), *production);
                let outgoing = self
                    .conditions
                    .entry(key.clone())
                    .or_insert_with(|| OutgoingCondition::new(condition.evaluation));
                outgoing.set_evaluation(condition.evaluation);
                let consumers = Self::consumer_keys(path, *production, ProductionKind::Condition, &condition.consumers);
                Self::register(&mut self.incoming, &consumers, outgoing.fresh_state());
                outgoing.consumers_mut().replace(consumers.clone());
                outgoing.consumers().notify();
                wanted.extend(consumers);
                live_conditions.insert(key);
            }
            for (production, consumers) in produced.results() {
                let key = OutgoingKey::new(path.clone(), *production);
                let outgoing = self.results.entry(key.clone()).or_insert_with(OutgoingResult::new);
                let consumers = Self::consumer_keys(path, *production, ProductionKind::Result, consumers);
                Self::register(&mut self.incoming, &consumers, outgoing.fresh_state());
                outgoing.consumers_mut().replace(consumers.clone());
                outgoing.consumers().notify();
                wanted.extend(consumers);
                live_results.insert(key);
            }
        }

        let stale: Vec<_> = self.conditions.keys().filter(|k| !live_conditions.contains(*k)).cloned().collect();
        for key in stale {
            if let Some(mut outgoing) = self.conditions.remove(&key) {
                outgoing.invalidate(&mut self.incoming);
            }
        }
        let stale: Vec<_> = self.results.keys().filter(|k| !live_results.contains(*k)).cloned().collect();
        for key in stale {
            if let Some(mut outgoing) = self.results.remove(&key) {
                outgoing.invalidate(&mut self.incoming);
            }
        }
        self.incoming.retain(|key, _| wanted.contains(key));
    }

    fn consumer_keys(
        producer: &ExperimentPath,
        production: ProductionType,
        kind: ProductionKind,
        consumers: &[ExperimentPath],
    ) -> IndexSet<IncomingKey> {
        consumers
            .iter()
            .map(|consumer| IncomingKey::new(consumer.clone(), producer.clone(), production, kind))
            .collect()
    }

    fn register(incoming: &mut HashMap<IncomingKey, Incoming>, keys: &IndexSet<IncomingKey>, fresh: IncomingState) {
        for key in keys {
            match incoming.get_mut(key) {
                Some(entry) if entry.is_outgoing_invalidated() => entry.reset(fresh),
                Some(_) => {}
                None => {
                    incoming.insert(key.clone(), Incoming::new(fresh));
                }
            }
        }
    }

    /// Drop everything an instruction produces or consumes
    pub(crate) fn remove_instruction(&mut self, path: &ExperimentPath) {
        self.invalidate_outgoing(path);
        self.conditions.retain(|key, _| &key.producer != path);
        self.results.retain(|key, _| &key.producer != path);
        for key in self.incoming_keys(path) {
            self.incoming.remove(&key);
            self.forget(&key);
        }
    }

    pub(crate) fn clear(&mut self) {
        for outgoing in self.conditions.values_mut() {
            outgoing.invalidate(&mut self.incoming);
        }
        for outgoing in self.results.values_mut() {
            outgoing.invalidate(&mut self.incoming);
        }
        self.conditions.clear();
        self.results.clear();
        self.incoming.clear();
    }

    fn incoming_keys(&self, consumer: &ExperimentPath) -> Vec<IncomingKey> {
        self.incoming
            .keys()
            .filter(|key| &key.consumer == consumer)
            .cloned()
            .collect()
    }

    fn forget(&mut self, key: &IncomingKey) {
        let outgoing_key = OutgoingKey::from(key);
        let consumers = match key.kind {
            ProductionKind::Condition => self.conditions.get_mut(&outgoing_key).map(OutgoingCondition::consumers_mut),
            ProductionKind::Result => self.results.get_mut(&outgoing_key).map(OutgoingResult::consumers_mut),
        };
        if let Some(consumers) = consumers {
            let remaining = consumers.keys().filter(|k| *k != key).cloned().collect();
            consumers.replace(remaining);
            consumers.notify();
        }
    }

    fn notify(&self, key: &IncomingKey) {
        let outgoing_key = OutgoingKey::from(key);
        match key.kind {
            ProductionKind::Condition => {
                if let Some(outgoing) = self.conditions.get(&outgoing_key) {
                    outgoing.consumers().notify();
                }
            }
            ProductionKind::Result => {
                if let Some(outgoing) = self.results.get(&outgoing_key) {
                    outgoing.consumers().notify();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::ExecutionContext;
    use crate::environment::AnyValue;
    use crate::executor::{Executor, ExecutorRegistry};
    use crate::planning::PlanningContext;
    use crate::procedure::{Instruction, Variables};
    use crate::types::Evaluation;

    struct Sample;
    struct Spectrum;

    struct Plans(fn(&mut PlanningContext<'_>));

    impl Executor for Plans {
        fn plan(&self, context: &mut PlanningContext<'_>) {
            (self.0)(context);
        }

        fn execute(&self, _context: &ExecutionContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> ExecutorRegistry {
        ExecutorRegistry::new()
            .with("holder", Plans(|c| c.prepares_condition::<Sample>(Evaluation::Serial)))
            .with(
                "acquire",
                Plans(|c| {
                    c.declare_condition_requirement::<Sample>();
                    c.observes_result::<Spectrum>();
                }),
            )
            .with("process", Plans(|c| c.declare_result_requirement::<Spectrum>()))
    }

    fn path(s: &str) -> ExperimentPath {
        s.parse().unwrap()
    }

    fn procedure(consumers: &[&str]) -> Procedure {
        consumers.iter().fold(
            Procedure::new("p").with("/holder", Instruction::new("holder", "holder")).unwrap(),
            |procedure, id| {
                procedure
                    .with(&format!("/holder/{id}"), Instruction::new(*id, "acquire"))
                    .unwrap()
            },
        )
    }

    fn wired(procedure: &Procedure) -> HandOffs {
        let dependents = ProcedureDependents::new(procedure, &registry(), &Variables::new()).unwrap();
        let mut hand_offs = HandOffs::default();
        hand_offs.rewire(procedure, &dependents);
        hand_offs
    }

    fn sample(consumer: &str) -> IncomingKey {
        IncomingKey::new(path(consumer), path("/holder"), ProductionType::of::<Sample>(), ProductionKind::Condition)
    }

    fn supplier() -> ValueSupplier {
        Arc::new(|| Arc::new(3_u8) as AnyValue)
    }

    #[test]
    fn test_rewire_registers_consumers_in_order() {
        let hand_offs = wired(&procedure(&["a", "b"]));
        assert_eq!(hand_offs.consumers_of(&path("/holder")), vec![path("/holder/a"), path("/holder/b")]);
        assert_eq!(hand_offs.incoming_state(&sample("/holder/a")), Some(IncomingState::Waiting));
    }

    #[test]
    fn test_serial_admission_through_arena() {
        let mut hand_offs = wired(&procedure(&["a", "b"]));
        let holder = OutgoingKey::new(path("/holder"), ProductionType::of::<Sample>());
        assert!(matches!(hand_offs.begin_acquire(&sample("/holder/a")), Admission::Wait(_)));

        hand_offs.begin_prepare(&holder, supplier()).unwrap();
        assert!(matches!(
            hand_offs.begin_prepare(&holder, supplier()),
            Err(ConductorError::IllegalPrepare(_))
        ));
        assert!(matches!(hand_offs.begin_acquire(&sample("/holder/b")), Admission::Admitted(Some(_))));
        assert!(matches!(hand_offs.begin_acquire(&sample("/holder/a")), Admission::Wait(_)));
        assert!(hand_offs.is_holding(&sample("/holder/b")));

        hand_offs.close_incoming(&sample("/holder/b"));
        assert!(!hand_offs.is_drained(&holder));
        assert!(matches!(hand_offs.begin_acquire(&sample("/holder/a")), Admission::Admitted(Some(_))));
        hand_offs.close_incoming(&sample("/holder/a"));
        assert!(hand_offs.is_drained(&holder));
        hand_offs.end_prepare(&holder);
    }

    #[test]
    fn test_invalidated_outgoing_closes_waiters_until_rewired() {
        let procedure = procedure(&["a"]);
        let mut hand_offs = wired(&procedure);
        hand_offs.invalidate_outgoing(&path("/holder"));
        assert!(matches!(hand_offs.begin_acquire(&sample("/holder/a")), Admission::Closed));

        let dependents = ProcedureDependents::new(&procedure, &registry(), &Variables::new()).unwrap();
        hand_offs.rewire(&procedure, &dependents);
        assert!(matches!(hand_offs.begin_acquire(&sample("/holder/a")), Admission::Wait(_)));
    }

    #[test]
    fn test_invalidate_incoming_allows_retry() {
        let mut hand_offs = wired(&procedure(&["a", "b"]));
        let holder = OutgoingKey::new(path("/holder"), ProductionType::of::<Sample>());
        hand_offs.begin_prepare(&holder, supplier()).unwrap();
        assert!(matches!(hand_offs.begin_acquire(&sample("/holder/a")), Admission::Admitted(_)));

        hand_offs.invalidate_incoming(&path("/holder/a"));
        assert_eq!(hand_offs.incoming_state(&sample("/holder/a")), Some(IncomingState::Waiting));
        assert!(matches!(hand_offs.begin_acquire(&sample("/holder/b")), Admission::Admitted(_)));
    }

    #[test]
    fn test_released_holder_keeps_producer_waiting() {
        let mut hand_offs = wired(&procedure(&["a"]));
        let holder = OutgoingKey::new(path("/holder"), ProductionType::of::<Sample>());
        hand_offs.begin_prepare(&holder, supplier()).unwrap();
        assert!(matches!(hand_offs.begin_acquire(&sample("/holder/a")), Admission::Admitted(_)));

        hand_offs.release_incoming(&sample("/holder/a"));
        assert_eq!(hand_offs.incoming_state(&sample("/holder/a")), Some(IncomingState::Waiting));
        assert!(!hand_offs.is_drained(&holder));
        assert!(matches!(hand_offs.begin_acquire(&sample("/holder/a")), Admission::Admitted(Some(_))));
        hand_offs.close_incoming(&sample("/holder/a"));
        assert!(hand_offs.is_drained(&holder));
    }

    #[test]
    fn test_terminated_producer_closes_conditions_but_keeps_results() {
        let procedure = procedure(&["a"])
            .with("/holder/a/process", Instruction::new("process", "process"))
            .unwrap();
        let mut hand_offs = wired(&procedure);
        let spectrum = OutgoingKey::new(path("/holder/a"), ProductionType::of::<Spectrum>());
        let reader = IncomingKey::new(
            path("/holder/a/process"),
            path("/holder/a"),
            ProductionType::of::<Spectrum>(),
            ProductionKind::Result,
        );
        hand_offs
            .observe_partial(&spectrum, Arc::new(|| Arc::new(vec![1.0_f64]) as AnyValue))
            .unwrap();

        hand_offs.terminate_outgoing(&path("/holder"));
        hand_offs.terminate_outgoing(&path("/holder/a"));
        assert!(matches!(hand_offs.begin_acquire(&sample("/holder/a")), Admission::Closed));
        assert!(matches!(hand_offs.begin_acquire(&reader), Admission::Admitted(None)));
    }

    #[test]
    fn test_dropped_consumer_is_forgotten() {
        let mut hand_offs = wired(&procedure(&["a", "b"]));
        hand_offs.remove_instruction(&path("/holder/a"));
        assert_eq!(hand_offs.consumers_of(&path("/holder")), vec![path("/holder/b")]);
        assert_eq!(hand_offs.incoming_state(&sample("/holder/a")), None);
    }
}
