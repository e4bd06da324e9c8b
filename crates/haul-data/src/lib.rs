#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Persistence layer for task records.

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{DataError, Result};
pub use memory::MemoryTaskStore;
pub use postgres::PgTaskStore;
