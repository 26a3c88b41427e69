//! Fuzz-corpus curation pipeline.
//!
//! `seedbank` maintains a directory-backed, content-addressed store of fuzz
//! inputs split into two collections: `corpus` (accepted, minimized inputs)
//! and `crashes` (inputs currently believed to reproduce a failure). Around
//! the store it provides:
//!
//! - [`sched`]: a bounded completion scheduler used everywhere the pipeline
//!   fans out short independent async operations (hashing, subprocess runs,
//!   history queries).
//! - [`store`]: dedup by content hash, adaptive truncated bucket naming with
//!   collision retry, merge-conflict recovery, crash-artifact relocation.
//! - [`regress`]: re-validation of stored crash inputs against the current
//!   fuzz targets, with promotion of inputs that no longer reproduce.
//! - [`freeze`]: a diff-friendly frozen snapshot (sorted JSON of compressed,
//!   base64 text payloads) plus an append-only seen ledger.
//!
//! External tools (the fuzzing engine, git) are reached only through the
//! narrow collaborators in [`process`] and [`history`]. Nothing here is safe
//! to run as two concurrent pipelines over the same store root; the caller
//! owns that invariant.

pub mod config;
pub mod conflict;
pub mod errors;
pub mod freeze;
pub mod hash;
pub mod history;
pub mod pipeline;
pub mod process;
pub mod regress;
pub mod sched;
pub mod store;

pub use config::Config;
pub use errors::{ProcessError, StoreError};
pub use hash::{ContentId, NameLength};
pub use history::{GitHistory, History};
pub use sched::{as_completed, as_settled, ExecPolicy};
pub use store::{Collection, Store};
