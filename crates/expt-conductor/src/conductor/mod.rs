//! The conductor engine
//!
//! [`Conductor`] holds the live procedure and one controller per
//! instruction. Each instruction body runs on its own thread and meets its
//! neighbours through condition and result hand-offs.
//!
//! ## Locking
//!
//! Two locks are involved:
//! - the control lock serializes `conduct`, `interrupt` and `clear`
//! - the state lock guards progress, hand-offs and the current output
//!
//! Every condition variable is waited on with the state lock. Bodies only
//! take it inside hand-off calls, and interrupts join body threads with it
//! released.

mod context;
mod execution;
mod hand_off;
mod incoming;
mod instruction;
mod outgoing;
mod output;

pub use context::ExecutionContext;
pub use execution::{ExecutionOutcome, ExecutionSnapshot};
pub use incoming::{ConditionHandle, ResultHandle};
pub use outgoing::Completeness;
pub use output::{ConductorOutput, InstructionProgress, OutputEvent};

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::ConductorConfig;
use crate::environment::{GlobalEnvironment, LocalEnvironment};
use crate::error::{ConductorError, PlanningError, Result};
use crate::executor::ExecutorRegistry;
use crate::path::ExperimentPath;
use crate::planning::ProcedureDependents;
use crate::procedure::Procedure;
use crate::state::ExecutionStatus;
use crate::storage::{Storage, StorageConfiguration};
use crate::types::ExecutionId;
use execution::Execution;
use hand_off::HandOffs;
use instruction::{InstructionExecution, InstructionSnapshot};

/// Executes procedures
///
/// Dropping the conductor interrupts every execution.
pub struct Conductor {
    shared: Arc<Shared>,
    control: Mutex<()>,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    completion: Condvar,
    executors: ExecutorRegistry,
    environment: Arc<dyn GlobalEnvironment>,
    storage: Arc<dyn StorageConfiguration>,
    config: ConductorConfig,
}

pub(crate) struct State {
    procedure: Option<Procedure>,
    progress: IndexMap<ExperimentPath, InstructionExecution>,
    pub(crate) hand_offs: HandOffs,
    output: Arc<ConductorOutput>,
}

/// Body thread and storage taken from a cancelled execution
type Cancelled = (ExperimentPath, Option<thread::JoinHandle<()>>, Option<Box<dyn Storage>>);

impl Conductor {
    /// Create a conductor
    ///
    /// # Arguments
    /// * `storage` - Locates per-instruction storage
    /// * `executors` - Executors instructions may name
    /// * `environment` - Resource and global variable provider
    /// * `config` - Engine configuration
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageConfiguration>,
        executors: ExecutorRegistry,
        environment: Arc<dyn GlobalEnvironment>,
        config: ConductorConfig,
    ) -> Self {
        let output = ConductorOutput::initial(config.event_capacity);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    procedure: None,
                    progress: IndexMap::new(),
                    hand_offs: HandOffs::default(),
                    output,
                }),
                completion: Condvar::new(),
                executors,
                environment,
                storage,
                config,
            }),
            control: Mutex::new(()),
        }
    }

    /// Conduct a procedure, replacing the current one
    ///
    /// Unchanged instructions keep running. Changed instructions are
    /// interrupted together with everything consuming their productions,
    /// then restarted. Instructions missing from `procedure` are
    /// interrupted and dropped.
    ///
    /// # Errors
    /// - [`ConductorError::Procedure`] or [`ConductorError::Planning`]: nothing
    ///   takes effect
    /// - [`ConductorError::Storage`] or [`ConductorError::Persist`] while
    ///   persisting: nothing takes effect
    /// - [`ConductorError::Storage`] or [`ConductorError::Spawn`] while
    ///   starting an instruction: the procedure is live, the failing
    ///   instructions are not running
    pub fn conduct(&self, procedure: Procedure) -> Result<Arc<ConductorOutput>> {
        let _control = self.control.lock();
        procedure.validate()?;
        let environment = LocalEnvironment::capture(Arc::clone(&self.shared.environment));
        let dependents = ProcedureDependents::new(&procedure, &self.shared.executors, environment.variables())?;
        let snapshots = self.snapshots(&procedure, &dependents, &environment)?;

        let previous = self.shared.state.lock().procedure.as_ref().map(|p| p.id().to_string());
        if self.shared.config.persist_procedures {
            self.shared.persist(&procedure, previous.as_deref())?;
        }
        tracing::info!(
            procedure = procedure.id(),
            instructions = procedure.len(),
            "conducting procedure"
        );

        let (dropped, changed) = {
            let state = self.shared.state.lock();
            let dropped: Vec<_> = state
                .progress
                .keys()
                .filter(|path| !procedure.contains(path))
                .cloned()
                .collect();
            let changed: Vec<_> = procedure
                .instructions()
                .filter(|(path, instruction)| {
                    state
                        .progress
                        .get(*path)
                        .is_some_and(|progress| !progress.is_compatible(instruction))
                })
                .map(|(path, _)| path.clone())
                .collect();
            (dropped, changed)
        };
        self.shared.interrupt_cascade(dropped.iter().chain(&changed).cloned());

        let mut state = self.shared.state.lock();
        for path in &dropped {
            state.progress.shift_remove(path);
            state.hand_offs.remove_instruction(path);
        }
        let mut previous_progress = std::mem::take(&mut state.progress);
        for (path, snapshot) in snapshots {
            let progress = match previous_progress.shift_remove(&path) {
                Some(mut progress) => {
                    progress.update(snapshot);
                    progress
                }
                None => InstructionExecution::new(snapshot),
            };
            state.progress.insert(path, progress);
        }
        state.hand_offs.rewire(&procedure, &dependents);

        let mut first_error = None;
        let mut started = Vec::new();
        for path in procedure.paths() {
            match Shared::execute(&self.shared, &mut state, path) {
                Ok(Some(execution)) => started.push((path.clone(), execution)),
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(%path, %error, "failed to start execution");
                    first_error.get_or_insert(error);
                }
            }
        }

        let executions: Vec<_> = state
            .progress
            .iter()
            .filter_map(|(path, progress)| progress.execution_id().map(|id| (path.clone(), id)))
            .collect();
        let successor = state.output.succeed_with_procedure(procedure.clone(), executions);
        for (path, execution) in started {
            successor.emit(OutputEvent::ExecutionStarted { path, execution });
        }
        state.output = Arc::clone(&successor);
        state.procedure = Some(procedure);
        drop(state);

        match first_error {
            Some(error) => Err(error),
            None => Ok(successor),
        }
    }

    fn snapshots(
        &self,
        procedure: &Procedure,
        dependents: &ProcedureDependents,
        environment: &LocalEnvironment,
    ) -> Result<Vec<(ExperimentPath, Arc<InstructionSnapshot>)>> {
        procedure
            .instructions()
            .map(|(path, instruction)| {
                let executor = self.shared.executors.get(instruction.executor()).ok_or_else(|| {
                    PlanningError::UnknownExecutor {
                        path: path.clone(),
                        executor: instruction.executor().to_string(),
                    }
                })?;
                let snapshot = InstructionSnapshot {
                    instruction: instruction.clone(),
                    executor,
                    dependencies: dependents.dependencies(path).cloned().unwrap_or_default(),
                    dependents: dependents.dependents(path).cloned().unwrap_or_default(),
                    environment: environment.clone(),
                };
                Ok((path.clone(), Arc::new(snapshot)))
            })
            .collect()
    }

    /// Interrupt every execution
    ///
    /// The procedure stays in place; a later [`conduct`](Self::conduct)
    /// restarts the interrupted instructions.
    pub fn interrupt(&self) {
        let _control = self.control.lock();
        let all: Vec<_> = self.shared.state.lock().progress.keys().cloned().collect();
        tracing::info!(instructions = all.len(), "interrupting conductor");
        self.shared.interrupt_cascade(all);
    }

    /// Interrupt everything, drop the procedure and deallocate its storage
    ///
    /// # Errors
    /// Returns [`ConductorError::Storage`] if the root storage could not be
    /// deallocated. Every execution has been interrupted regardless.
    pub fn clear(&self) -> Result<()> {
        let _control = self.control.lock();
        let all: Vec<_> = self.shared.state.lock().progress.keys().cloned().collect();
        self.shared.interrupt_cascade(all);

        let procedure = {
            let mut state = self.shared.state.lock();
            state.progress.clear();
            state.hand_offs.clear();
            let successor = state.output.succeed_with_clear();
            state.output = successor;
            state.procedure.take()
        };
        tracing::info!(procedure = procedure.as_ref().map(Procedure::id), "cleared conductor");

        if let Some(procedure) = procedure {
            let root = procedure.root_path();
            self.shared
                .storage
                .locate_storage(&root)
                .and_then(|storage| storage.deallocate())
                .map_err(|source| {
                    tracing::error!(path = %root, error = %source, "failed to deallocate storage");
                    ConductorError::storage(&root, source)
                })?;
        }
        Ok(())
    }

    /// Current output
    #[must_use]
    pub fn output(&self) -> Arc<ConductorOutput> {
        Arc::clone(&self.shared.state.lock().output)
    }

    /// Procedure being conducted
    #[must_use]
    pub fn procedure(&self) -> Option<Procedure> {
        self.shared.state.lock().procedure.clone()
    }

    /// Latest execution of an instruction
    #[must_use]
    pub fn execution(&self, path: &ExperimentPath) -> Option<ExecutionSnapshot> {
        let state = self.shared.state.lock();
        state.progress.get(path)?.execution.as_ref().map(Execution::snapshot)
    }

    /// Wait until no execution is pending or running
    ///
    /// Returns false on timeout.
    pub fn await_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.all_completed() {
                return true;
            }
            if self.shared.completion.wait_until(&mut state, deadline).timed_out() {
                return state.all_completed();
            }
        }
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        self.interrupt();
    }
}

impl std::fmt::Debug for Conductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Conductor")
            .field("procedure", &state.procedure.as_ref().map(Procedure::id))
            .field("instructions", &state.progress.len())
            .field("sequence", &state.output.sequence())
            .finish()
    }
}

impl State {
    fn all_completed(&self) -> bool {
        self.progress.values().all(|progress| {
            progress
                .execution
                .as_ref()
                .map_or(true, |execution| execution.status() == ExecutionStatus::Completed)
        })
    }
}

impl Shared {
    /// Start an instruction unless its execution is still valid
    fn execute(shared: &Arc<Shared>, state: &mut State, path: &ExperimentPath) -> Result<Option<ExecutionId>> {
        let Some(progress) = state.progress.get_mut(path) else {
            return Ok(None);
        };
        if progress.is_valid() {
            return Ok(None);
        }
        progress.execution = None;
        state.hand_offs.invalidate_incoming(path);

        let storage = match shared.storage.locate_storage(path) {
            Ok(storage) => storage,
            Err(source) => {
                state.hand_offs.invalidate_outgoing(path);
                state.hand_offs.finish_incoming(path);
                return Err(ConductorError::storage(path, source));
            }
        };
        let location = storage.location().to_path_buf();
        let mut execution = Execution::new(storage);
        let id = execution.id();
        let context = ExecutionContext::new(
            Arc::clone(shared),
            path.clone(),
            id,
            Arc::clone(progress.snapshot()),
            location,
            execution.cancel_flag(),
        );

        let mut builder = thread::Builder::new().name(format!("{}{}", shared.config.thread_name_prefix, path));
        if let Some(size) = shared.config.thread_stack_size {
            builder = builder.stack_size(size);
        }
        let body = Arc::clone(shared);
        match builder.spawn(move || execution::run(body, context)) {
            Ok(thread) => execution.start(thread),
            Err(source) => {
                let (_, storage) = execution.cancel();
                if let Some(Err(error)) = storage.map(|s| s.deallocate()) {
                    tracing::warn!(%path, %error, "failed to deallocate storage");
                }
                state.hand_offs.invalidate_outgoing(path);
                state.hand_offs.finish_incoming(path);
                return Err(ConductorError::Spawn {
                    path: path.clone(),
                    source,
                });
            }
        }
        tracing::info!(%path, execution = %id, "started execution");
        progress.execution = Some(execution);
        Ok(Some(id))
    }

    /// Record the end of a body run
    fn complete(
        &self,
        path: &ExperimentPath,
        id: ExecutionId,
        outcome: ExecutionOutcome,
        release_error: Option<crate::error::ReleaseError>,
    ) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(execution) = state
            .progress
            .get_mut(path)
            .and_then(|progress| progress.execution.as_mut())
            .filter(|execution| execution.id() == id)
        else {
            return;
        };
        let cancelled = execution.is_cancelled();
        execution.complete(outcome.clone(), release_error);
        if !cancelled {
            state.hand_offs.terminate_outgoing(path);
            state.hand_offs.finish_incoming(path);
        }
        state.output.emit(OutputEvent::ExecutionCompleted {
            path: path.clone(),
            execution: id,
            outcome,
        });
        self.completion.notify_all();
    }

    /// Interrupt instructions and, transitively, everything downstream
    ///
    /// Consumers of an interrupted producer and instructions ordered after
    /// it are interrupted too. All executions are cancelled before any is
    /// joined.
    fn interrupt_cascade<I>(&self, roots: I)
    where
        I: IntoIterator<Item = ExperimentPath>,
    {
        let mut state = self.state.lock();
        let mut queue: VecDeque<_> = roots.into_iter().collect();
        let mut affected = IndexSet::new();
        while let Some(path) = queue.pop_front() {
            if !affected.insert(path.clone()) {
                continue;
            }
            queue.extend(state.hand_offs.consumers_of(&path));
            if let Some(progress) = state.progress.get(&path) {
                queue.extend(progress.snapshot().dependents.ordering_dependents().iter().cloned());
            }
        }
        if affected.is_empty() {
            return;
        }

        let mut cancelled: Vec<Cancelled> = Vec::with_capacity(affected.len());
        for path in &affected {
            if let Some(execution) = state
                .progress
                .get_mut(path)
                .and_then(|progress| progress.execution.as_mut())
            {
                let (thread, storage) = execution.cancel();
                cancelled.push((path.clone(), thread, storage));
            }
            state.hand_offs.notify_involving(path);
        }

        for (path, thread, _) in &mut cancelled {
            if let Some(thread) = thread.take() {
                let joined = MutexGuard::unlocked(&mut state, || thread.join());
                if joined.is_err() {
                    tracing::warn!(%path, "instruction thread panicked");
                }
            }
        }

        for (path, _, storage) in cancelled {
            if let Some(Err(error)) = storage.map(|storage| storage.deallocate()) {
                tracing::warn!(%path, %error, "failed to deallocate storage");
            }
            state.hand_offs.invalidate_incoming(&path);
            state.hand_offs.invalidate_outgoing(&path);
            if let Some(execution) = state
                .progress
                .get_mut(&path)
                .and_then(|progress| progress.execution.as_mut())
            {
                execution.abandon();
            }
            tracing::debug!(%path, "interrupted execution");
        }
        self.completion.notify_all();
    }

    /// Write the procedure definition to root storage
    fn persist(&self, procedure: &Procedure, previous: Option<&str>) -> Result<()> {
        let root = procedure.root_path();
        let storage = self
            .storage
            .locate_storage(&root)
            .map_err(|source| ConductorError::storage(&root, source))?;
        let encoded = serde_json::to_vec_pretty(procedure).map_err(|e| ConductorError::Persist {
            procedure: procedure.id().to_string(),
            message: e.to_string(),
        })?;
        storage
            .write(&format!("{}.json", procedure.id()), &encoded)
            .map_err(|source| {
                tracing::error!(procedure = procedure.id(), error = %source, "failed to persist procedure");
                ConductorError::storage(&root, source)
            })?;
        if let Some(previous) = previous.filter(|previous| *previous != procedure.id()) {
            if let Err(error) = storage.remove(&format!("{previous}.json")) {
                tracing::warn!(procedure = previous, %error, "failed to remove superseded procedure");
            }
        }
        Ok(())
    }
}
