#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Engine-agnostic contract and task model for the haul orchestrator.
//!
//! Layout: `engine.rs` (backend trait and event channel), `model.rs` (task record
//! and engine DTOs), `source.rs` (source classification and magnet parsing),
//! `lifecycle.rs` (transition table), `collab.rs` (resolver, cloud-sync and
//! repository seams), `error.rs`.

pub mod collab;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod source;

pub use collab::{
    CloudSync, CopyRequest, JobHandle, JobState, JobStatus, Resolved, TaskFilter,
    TaskRepository, TransferConfig, TransferProgress, UploadRequest, UrlResolver,
};
pub use engine::{
    EngineEvent, EngineEventKind, EngineEventReceiver, EngineEvents, EngineSettings,
    ProgressSample, TaskEngine, engine_events,
};
pub use error::{
    CloudSyncError, EngineError, EngineResult, RepositoryError, ResolveError, TransitionError,
};
pub use haul_events::{FileProgress, TaskStatus};
pub use lifecycle::{allowed_targets, validate_transition};
pub use model::{
    Backend, EngineHandle, RemoveOptions, SubmitOptions, SubmitRequest, TaskRecord, TaskSnapshot,
    eta_seconds,
};
pub use source::{SourceKind, TaskSource};
