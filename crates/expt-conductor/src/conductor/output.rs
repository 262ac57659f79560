//! Conductor output succession
//!
//! A [`ConductorOutput`] is an immutable snapshot of which execution runs
//! each instruction. Every conduct or clear appends a successor; the chain
//! is never edited once superseded. Only the newest output is live and
//! emits execution events.
//!
//! All outputs of one conductor share an event stream: a receiver obtained
//! from any of them sees every event sent after it subscribed.

use std::sync::{Arc, OnceLock, Weak};

use indexmap::IndexMap;
use tokio::sync::broadcast;

use super::execution::ExecutionOutcome;
use crate::path::ExperimentPath;
use crate::procedure::{Instruction, Procedure};
use crate::types::ExecutionId;

/// Which execution runs an instruction
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionProgress {
    /// Instruction path
    pub path: ExperimentPath,
    /// Instruction definition
    pub instruction: Instruction,
    /// Execution running it
    pub execution: ExecutionId,
}

/// Event emitted by a live output
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// The output was superseded
    Succeeded {
        /// Sequence number of the successor
        sequence: u64,
        /// The successor
        successor: Arc<ConductorOutput>,
    },
    /// An execution started
    ExecutionStarted {
        /// Instruction path
        path: ExperimentPath,
        /// New execution
        execution: ExecutionId,
    },
    /// An execution finished
    ExecutionCompleted {
        /// Instruction path
        path: ExperimentPath,
        /// Finished execution
        execution: ExecutionId,
        /// How it finished
        outcome: ExecutionOutcome,
    },
}

/// One snapshot in the output chain
#[derive(Debug)]
pub struct ConductorOutput {
    sequence: u64,
    procedure: Option<Procedure>,
    progress: IndexMap<ExperimentPath, Arc<InstructionProgress>>,
    prior: Weak<ConductorOutput>,
    successor: OnceLock<Arc<ConductorOutput>>,
    events: broadcast::Sender<OutputEvent>,
}

impl ConductorOutput {
    /// First output of a conductor, with no procedure
    #[must_use]
    pub fn initial(event_capacity: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Arc::new(Self {
            sequence: 0,
            procedure: None,
            progress: IndexMap::new(),
            prior: Weak::new(),
            successor: OnceLock::new(),
            events,
        })
    }

    /// Position in the chain, starting at zero
    #[inline]
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Procedure being conducted, if any
    #[inline]
    #[must_use]
    pub fn procedure(&self) -> Option<&Procedure> {
        self.procedure.as_ref()
    }

    /// Progress per instruction, in procedure order
    #[inline]
    #[must_use]
    pub fn progress(&self) -> &IndexMap<ExperimentPath, Arc<InstructionProgress>> {
        &self.progress
    }

    /// Preceding output, while it is still referenced
    #[must_use]
    pub fn prior(&self) -> Option<Arc<ConductorOutput>> {
        self.prior.upgrade()
    }

    /// Following output, once superseded
    #[must_use]
    pub fn successor(&self) -> Option<Arc<ConductorOutput>> {
        self.successor.get().cloned()
    }

    /// Check if this output has not been superseded
    #[inline]
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.successor.get().is_none()
    }

    /// Subscribe to the conductor's events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.events.subscribe()
    }

    /// Append a successor conducting `procedure`
    ///
    /// Progress entries whose execution is unchanged are shared with this
    /// output.
    pub(crate) fn succeed_with_procedure<I>(self: &Arc<Self>, procedure: Procedure, executions: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (ExperimentPath, ExecutionId)>,
    {
        let progress = executions
            .into_iter()
            .filter_map(|(path, execution)| {
                let inherited = self
                    .progress
                    .get(&path)
                    .filter(|p| p.execution == execution)
                    .cloned();
                let progress = match inherited {
                    Some(progress) => progress,
                    None => Arc::new(InstructionProgress {
                        instruction: procedure.instruction(&path)?.clone(),
                        path: path.clone(),
                        execution,
                    }),
                };
                Some((path, progress))
            })
            .collect();
        self.succeed(Some(procedure), progress)
    }

    /// Append an empty successor
    pub(crate) fn succeed_with_clear(self: &Arc<Self>) -> Arc<Self> {
        self.succeed(None, IndexMap::new())
    }

    fn succeed(
        self: &Arc<Self>,
        procedure: Option<Procedure>,
        progress: IndexMap<ExperimentPath, Arc<InstructionProgress>>,
    ) -> Arc<Self> {
        let successor = Arc::new(Self {
            sequence: self.sequence + 1,
            procedure,
            progress,
            prior: Arc::downgrade(self),
            successor: OnceLock::new(),
            events: self.events.clone(),
        });
        if self.successor.set(Arc::clone(&successor)).is_err() {
            tracing::warn!(sequence = self.sequence, "output already superseded");
        }
        // No subscribers is fine.
        let _ = self.events.send(OutputEvent::Succeeded {
            sequence: successor.sequence,
            successor: Arc::clone(&successor),
        });
        tracing::debug!(sequence = successor.sequence, "output succeeded");
        successor
    }

    /// Emit an event if this output is still live
    pub(crate) fn emit(&self, event: OutputEvent) {
        if self.is_live() {
            let _ = self.events.send(event);
        }
    }
}
