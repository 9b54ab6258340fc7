//! `batchflow-core`: identifiers and references shared by every layer.
//!
//! This crate contains **pure** primitives (no infrastructure concerns). The
//! orchestrator only ever sees opaque identifiers and references; the data they
//! point at belongs to external collaborators.

pub mod error;
pub mod id;
pub mod reference;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{ExternalJobId, Parameter, RecordId, RunId, SuspensionToken};
pub use reference::{OutputRef, RecordBatchRef};
pub use version::ExpectedVersion;
