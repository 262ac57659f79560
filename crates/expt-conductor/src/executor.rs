//! Executor capability and registry
//!
//! An [`Executor`] decides *what* an instruction does. The conductor only
//! calls its two entry points: [`Executor::plan`] while building the
//! dependency index, and [`Executor::execute`] once per run.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::conductor::ExecutionContext;
use crate::planning::PlanningContext;

/// Identifier an instruction uses to name its executor
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorId(String);

impl ExecutorId {
    /// Create a new executor id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier text
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecutorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ExecutorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Externally supplied behaviour of an instruction
///
/// `plan` must be declarative: it is called during every conduct and its
/// declarations must depend only on the instruction's variables.
///
/// `execute` runs on a dedicated thread. Blocking calls on the context
/// return [`ConductorError::Interrupted`](crate::ConductorError::Interrupted)
/// once the run is cancelled; bodies are expected to propagate it.
pub trait Executor: Send + Sync {
    /// Declare requirements and productions
    fn plan(&self, context: &mut PlanningContext<'_>);

    /// Run the instruction
    ///
    /// # Errors
    /// Any error marks the run as failed. Dependents are released either way.
    fn execute(&self, context: &ExecutionContext) -> anyhow::Result<()>;
}

/// Executors available to a conductor, keyed by id
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<ExecutorId, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create new empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one with the same id
    pub fn register(&mut self, id: impl Into<ExecutorId>, executor: Arc<dyn Executor>) {
        self.executors.insert(id.into(), executor);
    }

    /// Builder: register an executor
    #[must_use]
    pub fn with(mut self, id: impl Into<ExecutorId>, executor: impl Executor + 'static) -> Self {
        self.register(id, Arc::new(executor));
        self
    }

    /// Look up an executor
    #[inline]
    #[must_use]
    pub fn get(&self, id: &ExecutorId) -> Option<Arc<dyn Executor>> {
        self.executors.get(id).cloned()
    }

    /// Check if executor exists
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &ExecutorId) -> bool {
        self.executors.contains_key(id)
    }

    /// Remove executor
    #[inline]
    pub fn remove(&mut self, id: &ExecutorId) -> bool {
        self.executors.remove(id).is_some()
    }

    /// Registered ids in sorted order
    #[must_use]
    pub fn ids(&self) -> Vec<&ExecutorId> {
        let mut ids: Vec<_> = self.executors.keys().collect();
        ids.sort();
        ids
    }

    /// Get number of registered executors
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// Check if registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.ids())
            .finish()
    }
}
