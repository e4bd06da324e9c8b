#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Remote-process engine that drives an aria2 daemon over JSON-RPC/WebSocket.
//!
//! Layout: `rpc.rs` (transport trait, `jsonrpsee` client, reconnect backoff),
//! `types.rs` (daemon payloads), `options.rs` (option mapping), `sampler.rs`
//! (poll loop and terminal-event dedup), `process.rs` (optional daemon launch),
//! `engine.rs` (the [`haul_core::TaskEngine`] implementation).

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod engine;
pub mod error;
pub mod options;
pub mod process;
pub mod rpc;
pub mod sampler;
pub mod types;

pub use engine::{Aria2Config, Aria2Engine};
pub use error::{RpcError, RpcResult};
pub use process::{Daemon, LaunchConfig};
pub use rpc::{Aria2Rpc, Backoff, WsRpc};
pub use sampler::{DaemonLists, SamplerState, VANISHED_MESSAGE};
pub use types::DownloadStatus;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
