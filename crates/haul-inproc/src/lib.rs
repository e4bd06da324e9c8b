#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! In-process engine running BitTorrent and direct HTTP transfers.
//!
//! Layout: `session/` (BitTorrent client seam, stub and optional librqbit
//! backend), `storage.rs` (per-info-hash directories and piece index),
//! `torrent.rs` (metadata watcher), `http.rs` (copy-by-URL transfers),
//! `tracker.rs` (live task table), `engine.rs` (the [`haul_core::TaskEngine`]
//! implementation and its sampler).

pub mod engine;
mod http;
pub mod session;
pub mod storage;
mod torrent;
mod tracker;

pub use engine::{InProcessConfig, InProcessEngine};
#[cfg(feature = "rqbit")]
pub use session::RqbitSession;
pub use session::{
    StubSession, TorrentAdd, TorrentFile, TorrentKey, TorrentMeta, TorrentPayload, TorrentSession,
    TorrentStats,
};
pub use storage::DynamicStorage;
