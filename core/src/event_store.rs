//! Event store trait consumed by the projection runtime.
//!
//! This module defines the abstraction the projector uses to read and write
//! event streams. It is deliberately shaped around the projector's access
//! pattern — merge-loading several streams by cursor position — rather than
//! around single-aggregate append/load, which is a different consumer with
//! different needs.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `composable-rust-postgres`): backed by an
//!   `event_streams`/`events` table pair.
//! - `InMemoryEventStore` (in `composable-rust-testing`): `HashMap`-backed,
//!   for deterministic tests.

use crate::stream::StreamId;
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// The requested stream does not exist.
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// The stream already exists and the caller asked to create it fresh.
    #[error("stream already exists: {0}")]
    StreamAlreadyExists(StreamId),

    /// Database connection or query failure.
    #[error("database error: {0}")]
    DatabaseError(String),

    /// Failed to serialize or deserialize event data.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// An event as delivered to a projection handler.
///
/// Carries everything a handler needs to decide whether and how to fold the
/// event into state, without requiring the handler to re-query the store.
#[derive(Clone, Debug)]
pub struct StoredEvent {
    /// Position of this event within its own stream, starting at 0.
    pub no: u64,
    /// The event type identifier, matching `Event::event_type`.
    pub name: String,
    /// The bincode-serialized event payload.
    pub payload: Vec<u8>,
    /// The stream this event belongs to.
    pub stream: StreamId,
    /// Optional metadata attached at append time.
    pub metadata: Option<serde_json::Value>,
}

/// One leg of a `merge_and_load` call: a single stream, a resume position,
/// and an optional matcher restricting which events on that stream qualify.
#[derive(Clone, Debug)]
pub struct StreamQuery {
    /// The stream to read from, or `None` to mean "every stream" (catch-all).
    pub stream: Option<StreamId>,
    /// Only events with `no >= from_number` are returned.
    pub from_number: u64,
    /// Optional event-name matcher; `None` accepts every event.
    pub matcher: Option<crate::projection::Matcher>,
}

/// Event store abstraction consumed by the projection runner.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn` so the
/// trait can be used as `Arc<dyn EventStore>`, the same convention the rest
/// of this crate's dyn-compatible traits follow.
pub trait EventStore: Send + Sync {
    /// Whether a stream with this name currently exists.
    fn has_stream(&self, stream: &StreamId) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>>;

    /// Create an empty stream. Errors if the stream already exists.
    fn create_stream(
        &self,
        stream: &StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>>;

    /// Delete a stream and all events on it.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::StreamNotFound` if the stream does not
    /// exist; callers that only want best-effort deletion should check
    /// `has_stream` first.
    fn delete_stream(
        &self,
        stream: &StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>>;

    /// Append events to a stream, creating it on demand.
    fn append_to(
        &self,
        stream: &StreamId,
        events: Vec<crate::event::SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>>;

    /// Merge-load events across one or more stream queries.
    ///
    /// The returned stream is finite: it yields whatever is currently
    /// available and ends, rather than tailing forever. The projection
    /// runner re-issues `merge_and_load` on every pass of its main loop.
    fn merge_and_load(
        &self,
        queries: Vec<StreamQuery>,
    ) -> Pin<
        Box<
            dyn Future<
                    Output = Result<
                        BoxStream<'static, Result<StoredEvent, EventStoreError>>,
                        EventStoreError,
                    >,
                > + Send
                + '_,
        >,
    >;

    /// List every real stream name known to the store (used by catch-all
    /// queries to discover new streams). Names beginning with `$` are
    /// internal/system streams and are excluded by implementations.
    fn all_stream_names(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EventStoreError>> + Send + '_>>;
}
