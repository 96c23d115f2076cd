//! Projection runtime for Composable Rust.
//!
//! # Overview
//!
//! This crate provides the long-running machinery that drives a projection
//! to completion against a shared [`composable_rust_core::event_store::EventStore`]
//! and [`composable_rust_core::projection::ControlRecordStore`]:
//!
//! - [`builder`] — `ProjectionBuilder<S>`, the write-once fluent configuration
//!   surface.
//! - [`handler`] — `HandlerRegistry<S>`, dispatching events to user folds.
//! - [`lock`] — `LockManager`, the cooperative lease protocol.
//! - [`poller`] — `poll_status`, translating the remote control row into
//!   local lifecycle decisions.
//! - [`sink`] — `Sink<S>`/`ReadModel`, the hook points that distinguish the
//!   plain projector from the read-model projector.
//! - [`runner`] — `Engine<S>`/`Projector<S, K>`, the main loop itself.
//!
//! # Example
//!
//! ```ignore
//! use composable_rust_projections::builder::ProjectionBuilder;
//!
//! let projector = ProjectionBuilder::new("order-totals".to_string(), event_store, control_store)
//!     .init(|| 0u64)?
//!     .from_all()?
//!     .when_any(sync_handler(|state, _event| Ok(state + 1)))?
//!     .build()?;
//!
//! projector.run(true).await?;
//! ```

pub mod builder;
pub mod handler;
pub mod lock;
pub mod poller;
pub mod runner;
pub mod sink;

pub use builder::ProjectionBuilder;
pub use runner::{Engine, Projector};
pub use sink::{PlainSink, ReadModel, ReadModelSink, Sink};
