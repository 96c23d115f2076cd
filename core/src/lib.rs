//! # Composable Rust Core
//!
//! Shared types and traits for the projection engine: event and stream
//! identity, the event store interface the runner consumes, and the
//! control-record model that coordinates runner processes over a shared
//! store.
//!
//! ## Modules
//!
//! - [`event`] — the `Event` trait and `SerializedEvent` wire format.
//! - [`stream`] — `StreamId` and `Version` newtypes.
//! - [`event_store`] — the `EventStore` trait consumed by the runner
//!   (`has_stream`/`create_stream`/`delete_stream`/`append_to`/`merge_and_load`).
//! - [`projection`] — `PositionMap`, `QuerySpec`, `ControlRecord`,
//!   `ProjectionStatus`, and the `ControlRecordStore` trait.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod event;
pub mod event_store;
pub mod projection;
pub mod stream;
