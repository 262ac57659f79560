//! Experiment conductor
//!
//! Executes a procedure: a tree of instructions, each bound to an executor,
//! that hand values to one another while they run.
//! - Planning asks every executor what it produces and requires, and
//!   resolves that into dependency edges
//! - Conditions are exclusive hand-offs admitted under an [`Evaluation`]
//!   policy (ordered, serial or parallel)
//! - Results are shared values observed as partial or complete
//! - Re-conducting a procedure restarts only the instructions whose
//!   definition changed, together with everything downstream of them
//!
//! # Example
//!
//! ```rust,ignore
//! use expt_conductor::prelude::*;
//!
//! # fn example() -> anyhow::Result<()> {
//! let executors = ExecutorRegistry::new()
//!     .with("holder", SampleHolder)
//!     .with("acquire", Acquisition);
//! let conductor = Conductor::new(
//!     Arc::new(FileSystemStorage::new("/tmp/experiment")),
//!     executors,
//!     Arc::new(StaticEnvironment::new()),
//!     ConductorConfig::default(),
//! );
//!
//! let procedure = Procedure::new("calibration")
//!     .with("/holder", Instruction::new("holder", "holder"))?
//!     .with("/holder/a", Instruction::new("a", "acquire"))?;
//! let output = conductor.conduct(procedure)?;
//! println!("conducting {} instructions", output.progress().len());
//! conductor.await_completion(Duration::from_secs(10));
//! # Ok(())
//! # }
//! ```

pub mod conductor;
pub mod config;
pub mod environment;
pub mod error;
pub mod executor;
pub mod path;
pub mod planning;
pub mod procedure;
pub mod state;
pub mod storage;
pub mod types;

pub use conductor::{
    Completeness, ConditionHandle, Conductor, ConductorOutput, ExecutionContext, ExecutionOutcome,
    ExecutionSnapshot, InstructionProgress, OutputEvent, ResultHandle,
};
pub use config::ConductorConfig;
pub use environment::{
    release_all, AnyValue, GlobalEnvironment, LocalEnvironment, Resource, ResourceLease,
    StaticEnvironment,
};
pub use error::{ConductorError, PlanningError, ProcedureError, ReleaseError, ResourceError, Result};
pub use executor::{Executor, ExecutorId, ExecutorRegistry};
pub use path::{ExperimentPath, PathError};
pub use planning::{
    Dependency, InstructionDependencies, InstructionDependents, PlanningContext, ProcedureDependents,
    ProducedCondition,
};
pub use procedure::{Instruction, Procedure, Variables};
pub use state::{ExecutionStatus, IncomingState, TransitionError};
pub use storage::{FileSystemStorage, Storage, StorageConfiguration};
pub use types::{DependencyKind, Evaluation, ExecutionId, ProductionKind, ProductionType};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for writing executors and driving a conductor
    pub use crate::{
        Conductor, ConductorConfig, ConductorError, Evaluation, ExecutionContext, Executor,
        ExecutorRegistry, ExperimentPath, FileSystemStorage, Instruction, PlanningContext, Procedure,
        StaticEnvironment,
    };
    pub use std::sync::Arc;
    pub use std::time::Duration;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
