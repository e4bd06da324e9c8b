#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Cloud-sync collaborator backed by an rclone remote-control server.
//!
//! Uploads run as rc async jobs (`operations/copyfile`, `sync/copy` and their
//! move variants); in-process HTTP downloads go through `operations/copyurl`
//! and are polled until the job settles or the caller cancels.

mod client;
mod types;

pub use client::{RcloneClient, RcloneConfig};
