#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Orchestration for haul: task records, the download and upload phases, and
//! the binary's service wiring.
//!
//! Layout: `download.rs` and `upload.rs` (the two phases), `ledger.rs`
//! (serialised record access), `resolver.rs` (URL probing), `wiring.rs` and
//! `bootstrap.rs` (settings to running services).

/// Application bootstrap.
pub mod bootstrap;
/// Download phase orchestration.
pub mod download;
/// Application error type.
pub mod error;
/// Serialised record access.
pub mod ledger;
/// Event publication.
pub mod publish;
/// Direct URL resolution.
pub mod resolver;
/// Upload phase orchestration.
pub mod upload;
/// Settings to component configuration.
pub mod wiring;

pub use bootstrap::run_app;
pub use download::{DownloadService, NewTask};
pub use error::{AppError, AppResult};
pub use ledger::{RecordGuard, TaskLedger};
pub use publish::Publisher;
pub use resolver::DirectResolver;
pub use upload::{UploadConfig, UploadService};
