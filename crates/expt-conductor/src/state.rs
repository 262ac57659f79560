//! Lifecycle state machines
//!
//! Two machines are tracked by the conductor:
//! - [`IncomingState`] for each consumer hand-off
//! - [`ExecutionStatus`] for each run of an instruction
//!
//! Illegal transitions return an error. With the `strict-debug` feature
//! they panic instead.

use serde::{Deserialize, Serialize};

/// Consumer side of a hand-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncomingState {
    /// Registered, not yet admitted
    Waiting,
    /// Admitted and holding the production
    Acquired,
    /// Finished with the production, or closed by the producer
    Done,
}

/// Run state of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Created, body not yet started
    Pending,
    /// Body running on its own thread
    Running,
    /// Body returned, failed or was interrupted
    Completed,
}

/// Illegal state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    /// Source state
    pub from: &'static str,
    /// Target state
    pub to: &'static str,
}

/// Allowed successors of an incoming state
///
/// `Waiting -> Waiting` and `Acquired -> Waiting` are the invalidation
/// transitions taken when the consumer is reset for a retry.
#[must_use]
pub fn incoming_transitions(from: IncomingState) -> &'static [IncomingState] {
    use IncomingState::*;
    match from {
        Waiting => &[Waiting, Acquired, Done],
        Acquired => &[Waiting, Done],
        Done => &[Done, Waiting],
    }
}

/// Allowed successors of an execution status
#[must_use]
pub fn execution_transitions(from: ExecutionStatus) -> &'static [ExecutionStatus] {
    use ExecutionStatus::*;
    match from {
        Pending => &[Running, Completed],
        Running => &[Completed],
        Completed => &[],
    }
}

/// Validate an incoming state transition
///
/// # Errors
/// Returns [`TransitionError`] if `to` is not reachable from `from`.
pub fn validate_incoming(from: IncomingState, to: IncomingState) -> Result<(), TransitionError> {
    if incoming_transitions(from).contains(&to) {
        Ok(())
    } else {
        illegal(incoming_name(from), incoming_name(to))
    }
}

/// Validate an execution status transition
///
/// # Errors
/// Returns [`TransitionError`] if `to` is not reachable from `from`.
pub fn validate_execution(from: ExecutionStatus, to: ExecutionStatus) -> Result<(), TransitionError> {
    if execution_transitions(from).contains(&to) {
        Ok(())
    } else {
        illegal(execution_name(from), execution_name(to))
    }
}

fn illegal(from: &'static str, to: &'static str) -> Result<(), TransitionError> {
    #[cfg(feature = "strict-debug")]
    panic!("Illegal state transition attempted: {from} -> {to}");

    #[allow(unreachable_code)]
    Err(TransitionError { from, to })
}

fn incoming_name(state: IncomingState) -> &'static str {
    match state {
        IncomingState::Waiting => "WAITING",
        IncomingState::Acquired => "ACQUIRED",
        IncomingState::Done => "DONE",
    }
}

fn execution_name(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "PENDING",
        ExecutionStatus::Running => "RUNNING",
        ExecutionStatus::Completed => "COMPLETED",
    }
}
