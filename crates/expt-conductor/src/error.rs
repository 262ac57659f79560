//! Error types for the conductor
//!
//! Errors are split by the phase that raises them:
//! - [`ProcedureError`]: a procedure value is structurally malformed
//! - [`PlanningError`]: dependency planning rejected the procedure
//! - [`ConductorError`]: engine failures at conduct or execution time
//!
//! Closed hand-offs ([`ConductorError::ConditionClosed`] and
//! [`ConductorError::ResultClosed`]) are ordinary values the caller is
//! expected to match on; they signal that the dependency is gone.

use std::fmt;
use std::io;

use crate::path::ExperimentPath;
use crate::types::ProductionType;

/// Structural problems with a procedure definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcedureError {
    /// Path text does not parse
    #[error("invalid instruction path '{0}'")]
    InvalidPath(String),

    /// Instruction paths must be absolute
    #[error("instruction path {0} is not absolute")]
    RelativePath(ExperimentPath),

    /// The root path addresses the procedure itself
    #[error("instruction cannot be placed at the root path")]
    RootInstruction,

    /// Parent path is neither the root nor another instruction
    #[error("instruction {path} has no parent instruction at {parent}")]
    OrphanInstruction {
        /// Offending instruction
        path: ExperimentPath,
        /// Missing parent
        parent: ExperimentPath,
    },

    /// Two instructions at the same path
    #[error("duplicate instruction at {0}")]
    DuplicatePath(ExperimentPath),
}

/// Dependency planning failures
///
/// Planning errors are fatal to a conduct: nothing takes effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    /// Executor id not registered
    #[error("instruction {path} names unknown executor '{executor}'")]
    UnknownExecutor {
        /// Instruction path
        path: ExperimentPath,
        /// Executor identifier
        executor: String,
    },

    /// Requirement cannot be resolved against an existing instruction
    #[error("instruction {path} requires {production} from {target}, which does not exist")]
    DanglingDependency {
        /// Consuming instruction
        path: ExperimentPath,
        /// Unresolved target (may be relative)
        target: String,
        /// Required production
        production: ProductionType,
    },

    /// Condition and result requirements on the same instruction
    #[error("instruction {0} cannot depend on results and conditions at the same time")]
    MixedRequirements(ExperimentPath),

    /// More than one primary requirement of a kind
    #[error("instruction {path} declares multiple primary {kind} requirements")]
    DuplicateRequirement {
        /// Instruction path
        path: ExperimentPath,
        /// "condition" or "result"
        kind: &'static str,
    },

    /// Producer does not declare the required production
    #[error("instruction {path} requires {production} but {producer} does not produce it")]
    UnsatisfiedRequirement {
        /// Consuming instruction
        path: ExperimentPath,
        /// Producing instruction
        producer: ExperimentPath,
        /// Required production
        production: ProductionType,
    },

    /// Result requirements form a cycle
    #[error("dependency cycle through {0}")]
    CyclicDependency(ExperimentPath),
}

/// Failure closing a single resource lease
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to release resource {resource}: {message}")]
pub struct ResourceError {
    /// Resource type name
    pub resource: String,
    /// Failure description
    pub message: String,
}

impl ResourceError {
    /// Create a new resource error
    #[must_use]
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// Aggregated resource release failure
///
/// The first failure is primary; later failures are kept as suppressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseError {
    /// First failure encountered
    pub primary: ResourceError,
    /// Failures after the first
    pub suppressed: Vec<ResourceError>,
}

impl fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        if !self.suppressed.is_empty() {
            write!(f, " ({} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for ReleaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.primary)
    }
}

/// Main conductor error type
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// Procedure malformed
    #[error("invalid procedure: {0}")]
    Procedure(#[from] ProcedureError),

    /// Planning rejected the procedure
    #[error("unable to conduct procedure: {0}")]
    Planning(#[from] PlanningError),

    /// Storage allocation, deallocation or persistence failed
    #[error("storage failure at {path}: {source}")]
    Storage {
        /// Storage path
        path: ExperimentPath,
        /// Underlying I/O cause
        #[source]
        source: io::Error,
    },

    /// Procedure could not be encoded for persistence
    #[error("unable to persist procedure '{procedure}': {message}")]
    Persist {
        /// Procedure id
        procedure: String,
        /// Encoder message
        message: String,
    },

    /// Producer was cancelled while consumers held its condition
    #[error("cancelled preparation of {0}")]
    CancelledPreparation(ProductionType),

    /// `prepare` called again before the previous preparation drained
    #[error("condition {0} is already being prepared")]
    IllegalPrepare(ProductionType),

    /// The calling execution has been interrupted
    #[error("execution of {0} was interrupted")]
    Interrupted(ExperimentPath),

    /// Condition hand-off closed
    #[error("condition {production} from {producer} is closed")]
    ConditionClosed {
        /// Producing instruction
        producer: ExperimentPath,
        /// Condition type
        production: ProductionType,
    },

    /// Result hand-off closed
    #[error("result {production} from {producer} is closed")]
    ResultClosed {
        /// Producing instruction
        producer: ExperimentPath,
        /// Result type
        production: ProductionType,
    },

    /// Acquire of a production the instruction never declared
    #[error("no {kind} dependency declared on {production}")]
    MissingDependency {
        /// "condition" or "result"
        kind: &'static str,
        /// Requested production
        production: ProductionType,
    },

    /// Prepare or observe of a production the instruction never declared
    #[error("instruction does not produce {0}")]
    UndeclaredProduction(ProductionType),

    /// Environment cannot provide the resource
    #[error("resource {resource} unavailable: {message}")]
    ResourceUnavailable {
        /// Resource type name
        resource: String,
        /// Provider message
        message: String,
    },

    /// One or more resources failed to release
    #[error("resource release failed: {0}")]
    Release(#[from] ReleaseError),

    /// Variable missing or of the wrong shape
    #[error("variable '{name}': {message}")]
    Variable {
        /// Variable name
        name: String,
        /// Decode message
        message: String,
    },

    /// Instruction thread could not be spawned
    #[error("unable to start execution of {path}: {source}")]
    Spawn {
        /// Instruction path
        path: ExperimentPath,
        /// Underlying I/O cause
        #[source]
        source: io::Error,
    },
}

impl ConductorError {
    /// Check if error signals a closed hand-off
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            ConductorError::ConditionClosed { .. } | ConductorError::ResultClosed { .. }
        )
    }

    /// Check if the caller can retry or carry on
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.is_closed() || matches!(self, ConductorError::Interrupted(_))
    }

    /// Check if error aborted a conduct before it took effect
    #[inline]
    #[must_use]
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            ConductorError::Planning(_) | ConductorError::Procedure(_)
        )
    }

    pub(crate) fn storage(path: &ExperimentPath, source: io::Error) -> Self {
        ConductorError::Storage {
            path: path.clone(),
            source,
        }
    }
}

/// Conductor result alias
pub type Result<T> = std::result::Result<T, ConductorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_error_display_counts_suppressed() {
        let error = ReleaseError {
            primary: ResourceError::new("r2", "stuck"),
            suppressed: vec![ResourceError::new("r3", "gone")],
        };
        assert_eq!(
            error.to_string(),
            "failed to release resource r2: stuck (1 suppressed)"
        );
    }

    #[test]
    fn test_closed_errors_are_recoverable() {
        let error = ConductorError::ConditionClosed {
            producer: ExperimentPath::root().child("a"),
            production: ProductionType::of::<u32>(),
        };
        assert!(error.is_closed());
        assert!(error.is_recoverable());

        let error = ConductorError::IllegalPrepare(ProductionType::of::<u32>());
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_planning_converts() {
        let error: ConductorError =
            PlanningError::MixedRequirements(ExperimentPath::root().child("b")).into();
        assert!(error.is_planning());
    }
}
