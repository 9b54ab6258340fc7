//! Infrastructure layer: stores, collaborators and the orchestrator engine.
//!
//! Everything here is async (tokio). The pure state machine lives in
//! `batchflow-workflow`; this crate invokes collaborators, persists runs and
//! jobs, and feeds the resulting events back into it.

pub mod collaborators;
pub mod completion;
pub mod config;
pub mod error;
pub mod launcher;
pub mod metadata_store;
pub mod orchestrator;
pub mod retrying;
pub mod run_store;
pub mod scheduler;

pub use completion::{
    CompletionAck, CompletionError, CompletionListener, ResumeWorker, ResumeWorkerHandle,
    completion_from_report,
};
pub use config::{CollaboratorUrls, Config, ConfigError, OrchestratorConfig};
pub use error::StoreError;
pub use launcher::{JobLauncher, LaunchError};
pub use metadata_store::{InMemoryMetadataStore, MetadataStore, PostgresMetadataStore, Resolution};
pub use orchestrator::{
    Collaborators, DEFAULT_JOB_RETENTION, Orchestrator, OrchestratorError, RecoveryReport, SweepReport,
};
pub use run_store::{InMemoryRunStore, PostgresRunStore, RunStore};
pub use scheduler::{Scheduler, SchedulerHandle, describe_schedule};
