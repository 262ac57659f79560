//! Per-instruction controller

use std::sync::Arc;

use super::execution::Execution;
use crate::environment::LocalEnvironment;
use crate::executor::Executor;
use crate::planning::{InstructionDependencies, InstructionDependents};
use crate::procedure::Instruction;
use crate::types::ExecutionId;

/// Everything an execution needs to know about its instruction
///
/// Replaced as a whole on every conduct, never edited.
pub(crate) struct InstructionSnapshot {
    pub(crate) instruction: Instruction,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) dependencies: InstructionDependencies,
    pub(crate) dependents: InstructionDependents,
    pub(crate) environment: LocalEnvironment,
}

pub(crate) struct InstructionExecution {
    snapshot: Arc<InstructionSnapshot>,
    pub(crate) execution: Option<Execution>,
}

impl InstructionExecution {
    pub(crate) fn new(snapshot: Arc<InstructionSnapshot>) -> Self {
        Self {
            snapshot,
            execution: None,
        }
    }

    pub(crate) fn snapshot(&self) -> &Arc<InstructionSnapshot> {
        &self.snapshot
    }

    /// Swap in the definition of a new conduct
    pub(crate) fn update(&mut self, snapshot: Arc<InstructionSnapshot>) {
        self.snapshot = snapshot;
    }

    /// Check if a running execution can carry on under `instruction`
    pub(crate) fn is_compatible(&self, instruction: &Instruction) -> bool {
        &self.snapshot.instruction == instruction
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.execution.as_ref().is_some_and(Execution::is_valid)
    }

    pub(crate) fn execution_id(&self) -> Option<ExecutionId> {
        self.execution.as_ref().map(Execution::id)
    }
}
