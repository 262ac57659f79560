//! One run of an instruction body
//!
//! An [`Execution`] owns the body's thread, its cancellation flag and its
//! storage. The body runs to completion on its own thread; the conductor
//! only cancels cooperatively and joins.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use super::context::ExecutionContext;
use super::Shared;
use crate::environment::release_all;
use crate::error::ReleaseError;
use crate::state::{validate_execution, ExecutionStatus};
use crate::storage::Storage;
use crate::types::ExecutionId;

/// How an execution finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    /// Body returned normally
    Succeeded,
    /// Body returned an error or panicked
    Failed(String),
    /// Body was cancelled
    Interrupted,
}

/// Point-in-time view of an execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSnapshot {
    /// Execution identity
    pub id: ExecutionId,
    /// Lifecycle status
    pub status: ExecutionStatus,
    /// False once interrupted or superseded
    pub valid: bool,
    /// Outcome, once completed
    pub outcome: Option<ExecutionOutcome>,
    /// Resource release failure of the body, if any
    pub release_error: Option<ReleaseError>,
}

pub(crate) struct Execution {
    id: ExecutionId,
    status: ExecutionStatus,
    valid: bool,
    outcome: Option<ExecutionOutcome>,
    release_error: Option<ReleaseError>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    storage: Option<Box<dyn Storage>>,
}

impl Execution {
    pub(crate) fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            id: ExecutionId::new(),
            status: ExecutionStatus::Pending,
            valid: true,
            outcome: None,
            release_error: None,
            cancel: Arc::new(AtomicBool::new(false)),
            thread: None,
            storage: Some(storage),
        }
    }

    pub(crate) fn id(&self) -> ExecutionId {
        self.id
    }

    pub(crate) fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Body thread started
    pub(crate) fn start(&mut self, thread: JoinHandle<()>) {
        self.thread = Some(thread);
        self.transition(ExecutionStatus::Running);
    }

    /// Body finished
    pub(crate) fn complete(&mut self, outcome: ExecutionOutcome, release_error: Option<ReleaseError>) {
        self.transition(ExecutionStatus::Completed);
        self.outcome = Some(outcome);
        self.release_error = release_error;
    }

    /// Interrupted before the body ran
    pub(crate) fn abandon(&mut self) {
        if self.status == ExecutionStatus::Pending {
            self.complete(ExecutionOutcome::Interrupted, None);
        }
    }

    /// Invalidate and signal cancellation, handing back what must be
    /// joined and deallocated outside the state lock
    pub(crate) fn cancel(&mut self) -> (Option<JoinHandle<()>>, Option<Box<dyn Storage>>) {
        self.valid = false;
        self.cancel.store(true, Ordering::SeqCst);
        (self.thread.take(), self.storage.take())
    }

    pub(crate) fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: self.id,
            status: self.status,
            valid: self.valid,
            outcome: self.outcome.clone(),
            release_error: self.release_error.clone(),
        }
    }

    fn transition(&mut self, to: ExecutionStatus) {
        match validate_execution(self.status, to) {
            Ok(()) => self.status = to,
            Err(error) => tracing::error!(execution = %self.id, %error, "rejected execution transition"),
        }
    }
}

/// Body thread entry point
pub(crate) fn run(shared: Arc<Shared>, context: ExecutionContext) {
    let span = context.log().clone();
    let _entered = span.enter();
    tracing::info!("execution started");

    let executor = context.executor();
    let result = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&context)));
    let outcome = match result {
        Ok(Ok(())) => ExecutionOutcome::Succeeded,
        Ok(Err(_)) if context.is_cancelled() => ExecutionOutcome::Interrupted,
        Ok(Err(error)) => {
            tracing::warn!(error = %format!("{error:#}"), "execution failed");
            ExecutionOutcome::Failed(format!("{error:#}"))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::warn!(%message, "execution panicked");
            ExecutionOutcome::Failed(message)
        }
    };

    let release_error = release_all(context.take_leases()).err();
    if let Some(error) = &release_error {
        tracing::warn!(%error, "resource release failed");
    }

    let path = context.path().clone();
    let id = context.id();
    drop(context);
    tracing::info!(?outcome, "execution completed");
    shared.complete(&path, id, outcome, release_error);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "execution panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::{Path, PathBuf};

    #[derive(Debug)]
    struct Nowhere(PathBuf);

    impl Storage for Nowhere {
        fn location(&self) -> &Path {
            &self.0
        }

        fn write(&self, _name: &str, _contents: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn remove(&self, _name: &str) -> io::Result<()> {
            Ok(())
        }

        fn deallocate(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn execution() -> Execution {
        Execution::new(Box::new(Nowhere(PathBuf::from("/tmp/nowhere"))))
    }

    #[test]
    fn test_cancel_invalidates_and_hands_back_storage() {
        let mut execution = execution();
        assert!(execution.is_valid());
        let (thread, storage) = execution.cancel();
        assert!(thread.is_none());
        assert!(storage.is_some());
        assert!(!execution.is_valid());
        assert!(execution.is_cancelled());

        let (_, storage) = execution.cancel();
        assert!(storage.is_none());
    }

    #[test]
    fn test_abandon_completes_pending_execution() {
        let mut execution = execution();
        execution.abandon();
        let snapshot = execution.snapshot();
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(snapshot.outcome, Some(ExecutionOutcome::Interrupted));
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("spectrum overflow")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "spectrum overflow");
    }
}
