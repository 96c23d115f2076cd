//! `PostgreSQL`-backed control-record store for Composable Rust projections.
//!
//! Provides the relational `ControlRecordStore` (C4) implementation the
//! projection runner depends on for its lease protocol and checkpoint
//! persistence. The event store itself is an external collaborator (see
//! `composable-rust-core::event_store::EventStore`) and is out of scope for
//! this crate.
//!
//! # Example
//!
//! ```ignore
//! use composable_rust_postgres::PostgresControlRecordStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresControlRecordStore::connect(
//!         "postgres://localhost/mydb",
//!         "projections".to_string(),
//!     ).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod control;

pub use control::PostgresControlRecordStore;
