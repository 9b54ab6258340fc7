//! Run lifecycle mechanics (pure; no IO, no clocks of its own).
//!
//! - Explicit state enum per run, advanced by a pure transition function
//! - Job bookkeeping for the single suspension point (`AwaitingCompletion`)
//! - Timeout budgets and retry policy shared by the engine in infra
//!
//! The engine in `batchflow-infra` is responsible for invoking collaborators,
//! persisting `Run`/`Job` records and feeding the resulting events back in here.

pub mod budget;
pub mod error;
pub mod job;
pub mod retry;
pub mod run;
pub mod state;

pub use budget::StepBudgets;
pub use error::{CollaboratorError, RunError, RunErrorKind};
pub use job::{Completion, Job, JobOutcome, JobResolution};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use run::Run;
pub use state::{
    FailureReason, RunEvent, RunOutcome, RunState, RunStatus, Step, TransitionError, transition,
};
