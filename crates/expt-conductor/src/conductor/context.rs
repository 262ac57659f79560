//! Execution context handed to instruction bodies

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use super::hand_off::OutgoingKey;
use super::incoming::{self, ConditionHandle, IncomingKey, ResultHandle};
use super::instruction::InstructionSnapshot;
use super::outgoing::ValueSupplier;
use super::Shared;
use crate::environment::{AnyValue, Resource, ResourceLease};
use crate::error::{ConductorError, Result};
use crate::executor::Executor;
use crate::path::ExperimentPath;
use crate::planning::Dependency;
use crate::procedure::{Instruction, Variables};
use crate::types::{ExecutionId, ProductionKind, ProductionType};

/// What an instruction body sees of the conductor
///
/// All blocking calls return [`ConductorError::Interrupted`] once the
/// execution is cancelled.
pub struct ExecutionContext {
    shared: Arc<Shared>,
    path: ExperimentPath,
    id: ExecutionId,
    snapshot: Arc<InstructionSnapshot>,
    variables: Variables,
    location: PathBuf,
    span: tracing::Span,
    cancel: Arc<AtomicBool>,
    leases: Mutex<Vec<Box<dyn ResourceLease>>>,
}

impl ExecutionContext {
    pub(crate) fn new(
        shared: Arc<Shared>,
        path: ExperimentPath,
        id: ExecutionId,
        snapshot: Arc<InstructionSnapshot>,
        location: PathBuf,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let variables = snapshot
            .instruction
            .variables()
            .over(snapshot.environment.variables());
        let span = tracing::info_span!("instruction", path = %path, execution = %id);
        Self {
            shared,
            path,
            id,
            snapshot,
            variables,
            location,
            span,
            cancel,
            leases: Mutex::new(Vec::new()),
        }
    }

    /// Path of the running instruction
    #[inline]
    #[must_use]
    pub fn path(&self) -> &ExperimentPath {
        &self.path
    }

    /// Identity of this run
    #[inline]
    #[must_use]
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Instruction definition
    #[inline]
    #[must_use]
    pub fn instruction(&self) -> &Instruction {
        &self.snapshot.instruction
    }

    /// Instruction variables layered over the environment's globals
    #[inline]
    #[must_use]
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Decode a variable
    ///
    /// # Errors
    /// Returns [`ConductorError::Variable`] if missing or malformed.
    pub fn variable<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.variables.get_as(name)
    }

    /// Storage directory allocated to this run
    #[inline]
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Span every log line of this run belongs to
    #[inline]
    #[must_use]
    pub fn log(&self) -> &tracing::Span {
        &self.span
    }

    /// Check if the run has been interrupted
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Block until the parent's condition of type `T` is handed over
    ///
    /// # Errors
    /// - [`ConductorError::MissingDependency`] if not declared in planning
    /// - [`ConductorError::ConditionClosed`] if the producer is gone
    /// - [`ConductorError::Interrupted`] if the run is cancelled
    pub fn acquire_condition<T: Send + Sync + 'static>(&self) -> Result<ConditionHandle<T>> {
        let production = ProductionType::of::<T>();
        let dependency = self
            .snapshot
            .dependencies
            .condition()
            .filter(|d| d.production == production)
            .ok_or(ConductorError::MissingDependency {
                kind: "condition",
                production,
            })?;
        let key = self.incoming_key(dependency, ProductionKind::Condition);
        let value = incoming::acquire(&self.shared, &key, &self.cancel)?
            .and_then(|value| value.downcast::<T>().ok())
            .ok_or_else(|| key.closed())?;
        Ok(ConditionHandle::new(Arc::clone(&self.shared), key, value, Arc::clone(&self.cancel)))
    }

    /// Block until the parent's result of type `T` has a value
    ///
    /// # Errors
    /// - [`ConductorError::MissingDependency`] if not declared in planning
    /// - [`ConductorError::ResultClosed`] if the producer is gone
    /// - [`ConductorError::Interrupted`] if the run is cancelled
    pub fn acquire_result<T: Send + Sync + 'static>(&self) -> Result<ResultHandle<T>> {
        let production = ProductionType::of::<T>();
        let dependency = self
            .snapshot
            .dependencies
            .result()
            .filter(|d| d.production == production)
            .ok_or(ConductorError::MissingDependency {
                kind: "result",
                production,
            })?;
        self.acquire_result_from(dependency)
    }

    /// Acquire every additional result of type `T`, in declaration order
    ///
    /// Each item blocks when pulled.
    pub fn acquire_additional_results<T: Send + Sync + 'static>(
        &self,
    ) -> impl Iterator<Item = Result<ResultHandle<T>>> + '_ {
        let production = ProductionType::of::<T>();
        self.snapshot
            .dependencies
            .additional_results()
            .iter()
            .filter(move |d| d.production == production)
            .map(|dependency| self.acquire_result_from(dependency))
    }

    fn acquire_result_from<T: Send + Sync + 'static>(&self, dependency: &Dependency) -> Result<ResultHandle<T>> {
        let key = self.incoming_key(dependency, ProductionKind::Result);
        incoming::acquire(&self.shared, &key, &self.cancel)?;
        Ok(ResultHandle::new(Arc::clone(&self.shared), key, Arc::clone(&self.cancel)))
    }

    /// Offer a condition of type `T` and block until every consumer is done
    ///
    /// `supplier` is called once per admitted consumer while the conductor
    /// state is locked; it must not call back into this context.
    ///
    /// # Errors
    /// - [`ConductorError::UndeclaredProduction`] if not declared in planning
    /// - [`ConductorError::IllegalPrepare`] if a preparation is in flight
    /// - [`ConductorError::CancelledPreparation`] if the run is cancelled
    pub fn prepare_condition<T, F>(&self, supplier: F) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let production = ProductionType::of::<T>();
        if !self.snapshot.dependents.prepares(&production) {
            return Err(ConductorError::UndeclaredProduction(production));
        }
        let key = OutgoingKey::new(self.path.clone(), production);
        let supplier: ValueSupplier = Arc::new(move || Arc::new(supplier()) as AnyValue);

        let mut state = self.shared.state.lock();
        if self.is_cancelled() {
            return Err(ConductorError::CancelledPreparation(production));
        }
        let signal = state.hand_offs.begin_prepare(&key, supplier)?;
        let outcome = loop {
            if self.is_cancelled() {
                break Err(ConductorError::CancelledPreparation(production));
            }
            if state.hand_offs.is_drained(&key) {
                break Ok(());
            }
            signal.wait(&mut state);
        };
        state.hand_offs.end_prepare(&key);
        tracing::debug!(%production, ok = outcome.is_ok(), "preparation finished");
        outcome
    }

    /// Observe a partial result of type `T`, evaluated lazily on read
    ///
    /// # Errors
    /// Returns [`ConductorError::UndeclaredProduction`] if not declared in
    /// planning.
    pub fn observe_partial_result<T, F>(&self, supplier: F) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.observe::<T>(Arc::new(move || Arc::new(supplier()) as AnyValue))
    }

    /// Observe a partial result of type `T`
    ///
    /// # Errors
    /// Returns [`ConductorError::UndeclaredProduction`] if not declared in
    /// planning.
    pub fn set_result<T: Send + Sync + 'static>(&self, value: T) -> Result<()> {
        let value: AnyValue = Arc::new(value);
        self.observe::<T>(Arc::new(move || Arc::clone(&value)))
    }

    /// Mark the result of type `T` complete
    ///
    /// # Errors
    /// Returns [`ConductorError::UndeclaredProduction`] if not declared in
    /// planning.
    pub fn complete_observation<T: 'static>(&self) -> Result<()> {
        let key = self.outgoing_result::<T>()?;
        self.shared.state.lock().hand_offs.complete_result(&key)
    }

    /// Observe the complete result of type `T`
    ///
    /// # Errors
    /// Returns [`ConductorError::UndeclaredProduction`] if not declared in
    /// planning.
    pub fn observe_result<T: Send + Sync + 'static>(&self, value: T) -> Result<()> {
        self.set_result(value)?;
        self.complete_observation::<T>()
    }

    fn observe<T: 'static>(&self, supplier: ValueSupplier) -> Result<()> {
        let key = self.outgoing_result::<T>()?;
        self.shared.state.lock().hand_offs.observe_partial(&key, supplier)
    }

    fn outgoing_result<T: 'static>(&self) -> Result<OutgoingKey> {
        let production = ProductionType::of::<T>();
        if !self.snapshot.dependents.observes(&production) {
            return Err(ConductorError::UndeclaredProduction(production));
        }
        Ok(OutgoingKey::new(self.path.clone(), production))
    }

    /// Lease a resource of type `T` from the environment
    ///
    /// The lease is released when the run ends.
    ///
    /// # Errors
    /// - [`ConductorError::MissingDependency`] if not declared in planning
    /// - [`ConductorError::ResourceUnavailable`] if the environment refuses
    /// - [`ConductorError::Interrupted`] if the run is cancelled
    pub fn acquire_resource<T: Send + Sync + 'static>(&self) -> Result<Resource<T>> {
        let resource = ProductionType::of::<T>();
        if !self.snapshot.dependencies.requires_resource(&resource) {
            return Err(ConductorError::MissingDependency {
                kind: "resource",
                production: resource,
            });
        }
        if self.is_cancelled() {
            return Err(ConductorError::Interrupted(self.path.clone()));
        }
        let lease = self.snapshot.environment.provide_resource(&resource)?;
        let Ok(value) = lease.value().downcast::<T>() else {
            if let Err(error) = lease.release() {
                tracing::warn!(%error, "failed to release mistyped resource");
            }
            return Err(ConductorError::ResourceUnavailable {
                resource: resource.to_string(),
                message: "provider returned a value of another type".to_string(),
            });
        };
        self.leases.lock().push(lease);
        tracing::debug!(%resource, "acquired resource");
        Ok(Resource::new(resource, value))
    }

    pub(crate) fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.snapshot.executor)
    }

    pub(crate) fn take_leases(&self) -> Vec<Box<dyn ResourceLease>> {
        std::mem::take(&mut *self.leases.lock())
    }

    fn incoming_key(&self, dependency: &Dependency, kind: ProductionKind) -> IncomingKey {
        IncomingKey::new(self.path.clone(), dependency.to.clone(), dependency.production, kind)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}
