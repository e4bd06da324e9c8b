#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Event vocabulary and the in-process fan-out bus shared by the haul services.
//!
//! Layout: `payloads.rs` (event enum and envelope), `status.rs` (task lifecycle
//! status), `routing.rs` (broadcast bus with replay), `error.rs` (bus errors).

pub mod error;
pub mod payloads;
pub mod routing;
pub mod status;

pub use error::{EventBusError, EventBusResult};
pub use payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId, FileProgress};
pub use routing::{EventBus, EventStream};
pub use status::TaskStatus;
