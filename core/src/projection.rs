//! Control-record, position-map, and query-spec types shared by the
//! projection runner.
//!
//! # Overview
//!
//! A projection is a fold over one or more event streams. Its durable state
//! is the **control record**: a `(name, position, state, status,
//! locked_until)` row that lives in a shared store (`ControlRecordStore`) so
//! that multiple runner processes can cooperate over a lease.
//!
//! This module defines the data shapes (`PositionMap`, `QuerySpec`,
//! `Matcher`, `ControlRecord`, `ProjectionStatus`) and the
//! `ControlRecordStore` trait the runner depends on. The main loop itself
//! lives in `composable-rust-projections`.

use crate::stream::StreamId;
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// `init` was called a second time on the same builder.
    #[error("projection builder already initialized")]
    AlreadyInitialized,

    /// `from_all` / `from_stream` / `from_streams` was called a second time.
    #[error("projection query already configured")]
    FromAlreadyCalled,

    /// `when` / `when_any` was called a second time.
    #[error("projection handlers already configured")]
    WhenAlreadyCalled,

    /// `run` was called with no handlers configured.
    #[error("projection has no handler configured")]
    NoHandler,

    /// `run` was called with no query configured, or with an explicit
    /// empty stream list — both resolve to a permanently-idle subscription
    /// that would never dispatch an event.
    #[error("projection has no query configured")]
    NoQuery,

    /// `run` was called before `init` seeded the working state.
    #[error("projection state not initialised")]
    StateNotInitialised,

    /// A mutating control-row query affected zero rows.
    #[error("projection not found: {0}")]
    ProjectionNotFound(String),

    /// The lease could not be acquired (tightened per the open-question
    /// recommendation: callers that choose not to proceed optimistically
    /// surface this instead).
    #[error("could not acquire lock for projection: {0}")]
    LockNotAcquired(String),

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Lifecycle status of a projection, as observed in its control row.
///
/// Initial value is `Idle`. Status transitions are driven both locally (the
/// runner sets `Running` on lease acquisition, `Idle` on release) and
/// remotely (an operator writes `Stopping`/`Deleting`/`Resetting` into the
/// row out of band).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectionStatus {
    /// No runner currently holds the lease.
    Idle,
    /// A runner holds the lease and is actively processing.
    Running,
    /// An operator has asked the runner to stop after its current batch.
    Stopping,
    /// An operator has asked the runner to delete the control row (and,
    /// for the plain projector, its emitted-events stream).
    Deleting,
    /// As `Deleting`, but also delete whatever the variant-specific target
    /// is (the emitted stream for the plain projector, the read model for
    /// the read-model projector).
    DeletingInclEmitted,
    /// An operator has asked the runner to zero positions and state.
    Resetting,
}

/// Per-stream cursor positions: the last event number successfully
/// dispatched for each stream.
///
/// Backed by a `BTreeMap` rather than a `HashMap` so that serialized control
/// rows are byte-stable across runs, which matters for snapshot-style tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionMap(BTreeMap<StreamId, u64>);

impl PositionMap {
    /// An empty position map.
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// The last processed event number for `stream`, or `0` if the stream
    /// has never been seen.
    #[must_use]
    pub fn get(&self, stream: &StreamId) -> u64 {
        self.0.get(stream).copied().unwrap_or(0)
    }

    /// Record `no` as the last processed event number for `stream`.
    pub fn set(&mut self, stream: StreamId, no: u64) {
        self.0.insert(stream, no);
    }

    /// Iterate over `(stream, position)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&StreamId, &u64)> {
        self.0.iter()
    }

    /// Whether this map has an entry for `stream`.
    #[must_use]
    pub fn contains(&self, stream: &StreamId) -> bool {
        self.0.contains_key(stream)
    }

    /// Seed an entry to `0` if one is not already present, without
    /// disturbing existing entries. Used when preparing positions: the
    /// query's stream set is unioned in, but persisted positions win.
    pub fn seed_missing(&mut self, stream: StreamId) {
        self.0.entry(stream).or_insert(0);
    }

    /// Reset to empty, as happens on `reset()`.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Whether no streams have been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Opaque predicate over event metadata, passed through to the event store.
///
/// The projector never inspects a matcher's contents; it only threads it
/// into `merge_and_load`. Modeled as a JSON value since the consumed event
/// store treats matchers the same way it treats other metadata filters.
pub type Matcher = serde_json::Value;

/// What a projector should consume: every stream, or a named subset, each
/// with an optional matcher.
#[derive(Debug, Clone)]
pub enum QuerySpec {
    /// Consume every stream known to the event store (excluding internal
    /// `$`-prefixed streams).
    All,
    /// Consume exactly these streams, each with its own optional matcher.
    Streams(Vec<(StreamId, Option<Matcher>)>),
}

impl QuerySpec {
    /// The explicit stream list, or an empty slice for `All` (callers that
    /// need the full set for `All` must consult the event store).
    #[must_use]
    pub fn streams(&self) -> &[(StreamId, Option<Matcher>)] {
        match self {
            QuerySpec::All => &[],
            QuerySpec::Streams(s) => s,
        }
    }
}

/// A projection's control record: the one durable row shared across runner
/// processes for a given projection `name`.
#[derive(Debug, Clone)]
pub struct ControlRecord {
    /// Unique projection identifier.
    pub name: String,
    /// Per-stream cursor positions.
    pub position: PositionMap,
    /// The projection's folded state, JSON-serializable.
    pub state: serde_json::Value,
    /// Lifecycle status.
    pub status: ProjectionStatus,
    /// Lease expiry, or `None` if no runner currently holds it.
    pub locked_until: Option<DateTime<Utc>>,
}

/// CRUD and lease operations over the shared control-record store.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns, matching `EventStore` and
/// the rest of this crate's dyn-compatible traits, so implementations can be
/// shared as `Arc<dyn ControlRecordStore>`.
///
/// # Row-affected discipline
///
/// Every mutating method that targets a single row by `name` must verify
/// exactly one row was affected and return
/// [`ProjectionError::ProjectionNotFound`] otherwise. This is the only local
/// check that detects "my row was deleted out from under me" (§4.2).
pub trait ControlRecordStore: Send + Sync {
    /// Whether a control row exists for `name`.
    fn exists(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Insert a fresh control row with empty position/state and no lock.
    /// Callers are expected to check `exists == false` first; this method
    /// does not itself guard against duplicate inserts.
    fn create(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Load the persisted position and state for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::ProjectionNotFound`] if no row exists.
    fn load(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(PositionMap, serde_json::Value)>> + Send + '_>>;

    /// The canonical checkpoint write: persists position, state, and
    /// refreshes the lease, all in one statement.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::ProjectionNotFound`] if zero rows were
    /// affected.
    fn persist(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
        state: &serde_json::Value,
        position: &PositionMap,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Read the current `status` column.
    fn fetch_status(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProjectionStatus>> + Send + '_>>;

    /// Overwrite `status` without touching the lease.
    fn update_status(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Release the lease and set `status` in one statement
    /// (`locked_until = NULL`).
    fn clear_lock(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Conditionally acquire the lease: succeeds only if `locked_until` is
    /// null or in the past. On success, also sets `status = Running`.
    fn acquire_lock(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Unconditionally extend the lease (called on idle polls).
    fn refresh_lock(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Delete the control row entirely.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::ProjectionNotFound`] if zero rows were
    /// affected.
    fn delete_row(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_map_defaults_to_zero() {
        let map = PositionMap::new();
        assert_eq!(map.get(&StreamId::new("s")), 0);
    }

    #[test]
    fn position_map_set_and_get() {
        let mut map = PositionMap::new();
        map.set(StreamId::new("s"), 3);
        assert_eq!(map.get(&StreamId::new("s")), 3);
        assert!(map.contains(&StreamId::new("s")));
        assert!(!map.contains(&StreamId::new("other")));
    }

    #[test]
    fn position_map_seed_missing_does_not_clobber() {
        let mut map = PositionMap::new();
        map.set(StreamId::new("s"), 5);
        map.seed_missing(StreamId::new("s"));
        map.seed_missing(StreamId::new("t"));
        assert_eq!(map.get(&StreamId::new("s")), 5);
        assert_eq!(map.get(&StreamId::new("t")), 0);
    }

    #[test]
    fn position_map_clear_empties() {
        let mut map = PositionMap::new();
        map.set(StreamId::new("s"), 5);
        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn query_spec_all_has_no_explicit_streams() {
        assert!(QuerySpec::All.streams().is_empty());
    }

    #[test]
    fn query_spec_streams_roundtrip() {
        let spec = QuerySpec::Streams(vec![(StreamId::new("s"), None)]);
        assert_eq!(spec.streams().len(), 1);
    }

    #[test]
    fn projection_status_serializes_kebab_case() {
        let json = serde_json::to_string(&ProjectionStatus::DeletingInclEmitted)
            .expect("serialization should succeed");
        assert_eq!(json, "\"deleting-incl-emitted\"");
    }
}
