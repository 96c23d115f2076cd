//! Write-once fluent builder (C2/§4.1): `ProjectionBuilder<S>`.
//!
//! One struct, bool-guarded fields, synchronous `Result` returns — matching
//! this workspace's existing fluent builders rather than a staged-builder
//! (typestate) encoding.

use crate::handler::{Handler, HandlerRegistry};
use crate::runner::{Engine, Projector};
use crate::sink::{PlainSink, ReadModel, ReadModelSink};
use composable_rust_core::event_store::EventStore;
use composable_rust_core::projection::{ControlRecordStore, Matcher, ProjectionError, QuerySpec, Result};
use composable_rust_core::stream::StreamId;
use std::collections::HashMap;
use std::sync::Arc;

/// A thunk re-invoked on every `reset()` to restore the initial state.
pub type InitThunk<S> = Arc<dyn Fn() -> S + Send + Sync>;

/// Write-once fluent configuration surface over [`Engine`]/[`Projector`].
///
/// Each of `init`, `from*`, `when*` is accepted at most once; a second call
/// returns the documented error instead of panicking — these are programmer
/// errors, raised synchronously, never as a panic (§7).
pub struct ProjectionBuilder<S> {
    name: String,
    event_store: Arc<dyn EventStore>,
    control_store: Arc<dyn ControlRecordStore>,
    init_thunk: Option<InitThunk<S>>,
    state: Option<S>,
    query: Option<QuerySpec>,
    handlers: Option<HandlerRegistry<S>>,
    lock_timeout: chrono::Duration,
    persist_block_size: u64,
    update_lock_threshold: chrono::Duration,
}

impl<S> ProjectionBuilder<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Start configuring a projection named `name`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        event_store: Arc<dyn EventStore>,
        control_store: Arc<dyn ControlRecordStore>,
    ) -> Self {
        Self {
            name: name.into(),
            event_store,
            control_store,
            init_thunk: None,
            state: None,
            query: None,
            handlers: None,
            lock_timeout: chrono::Duration::milliseconds(1000),
            persist_block_size: 1000,
            update_lock_threshold: chrono::Duration::zero(),
        }
    }

    /// Seed the initial state. Evaluated immediately; re-invoked on every
    /// `reset()` so the projection returns to the same starting value.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::AlreadyInitialized`] if called twice.
    pub fn init<F>(mut self, thunk: F) -> Result<Self>
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        if self.init_thunk.is_some() {
            return Err(ProjectionError::AlreadyInitialized);
        }
        let thunk: InitThunk<S> = Arc::new(thunk);
        self.state = Some(thunk());
        self.init_thunk = Some(thunk);
        Ok(self)
    }

    /// Consume every stream known to the event store.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::FromAlreadyCalled`] if any `from*` method
    /// was already called.
    pub fn from_all(mut self) -> Result<Self> {
        if self.query.is_some() {
            return Err(ProjectionError::FromAlreadyCalled);
        }
        self.query = Some(QuerySpec::All);
        Ok(self)
    }

    /// Consume exactly one stream with an optional matcher.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::FromAlreadyCalled`] if any `from*` method
    /// was already called.
    pub fn from_stream(mut self, stream: StreamId, matcher: Option<Matcher>) -> Result<Self> {
        if self.query.is_some() {
            return Err(ProjectionError::FromAlreadyCalled);
        }
        self.query = Some(QuerySpec::Streams(vec![(stream, matcher)]));
        Ok(self)
    }

    /// Consume exactly the given streams, each with its own matcher.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::FromAlreadyCalled`] if any `from*` method
    /// was already called.
    pub fn from_streams(mut self, streams: Vec<(StreamId, Option<Matcher>)>) -> Result<Self> {
        if self.query.is_some() {
            return Err(ProjectionError::FromAlreadyCalled);
        }
        self.query = Some(QuerySpec::Streams(streams));
        Ok(self)
    }

    /// Dispatch events by name through a mapping of handlers.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::WhenAlreadyCalled`] if any `when*` method
    /// was already called.
    pub fn when(mut self, handlers: HashMap<String, Handler<S>>) -> Result<Self> {
        if self.handlers.is_some() {
            return Err(ProjectionError::WhenAlreadyCalled);
        }
        self.handlers = Some(HandlerRegistry::Named(handlers));
        Ok(self)
    }

    /// Dispatch every event through one catch-all handler.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::WhenAlreadyCalled`] if any `when*` method
    /// was already called.
    pub fn when_any(mut self, handler: Handler<S>) -> Result<Self> {
        if self.handlers.is_some() {
            return Err(ProjectionError::WhenAlreadyCalled);
        }
        self.handlers = Some(HandlerRegistry::CatchAll(handler));
        Ok(self)
    }

    /// Override the lease duration (default 1000ms).
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Override the number of events between forced checkpoints (default
    /// 1000).
    #[must_use]
    pub const fn persist_block_size(mut self, block_size: u64) -> Self {
        self.persist_block_size = block_size;
        self
    }

    /// Override the minimum interval between idle-poll lease refreshes
    /// (default zero — refresh on every idle poll).
    #[must_use]
    pub const fn update_lock_threshold(mut self, threshold: chrono::Duration) -> Self {
        self.update_lock_threshold = threshold;
        self
    }

    /// Finish configuration and produce a plain (no read model) projector.
    ///
    /// Deliberately does not perform the `noHandler`/`stateNotInitialised`/
    /// `noQuery` preflight check; an unconfigured projector is representable
    /// and the error surfaces at `run()` instead (§4.5 step 1). An unset
    /// `from*` call and an explicit `from_streams(vec![])` both resolve to
    /// the same empty-stream-list query here, so both are caught uniformly
    /// by that same `run()`-time check. Returns `Result` for symmetry with
    /// the rest of the fluent surface even though this step cannot itself
    /// fail.
    ///
    /// # Errors
    ///
    /// Never returns `Err`; kept fallible for call-site consistency with the
    /// preceding `?`-chained builder calls.
    pub fn build(self) -> Result<Projector<S, PlainSink>> {
        let stream = StreamId::new(self.name.clone());
        let sink = PlainSink::new(self.event_store.clone(), stream);
        Ok(self.build_with_sink(sink))
    }

    /// Finish configuration and produce a read-model projector driving
    /// `read_model` through its lifecycle alongside the engine (C8).
    ///
    /// # Errors
    ///
    /// Never returns `Err`; kept fallible for call-site consistency with the
    /// preceding `?`-chained builder calls.
    pub fn build_read_model<R: ReadModel>(
        self,
        read_model: R,
    ) -> Result<Projector<S, ReadModelSink<R>>> {
        Ok(self.build_with_sink(ReadModelSink::new(read_model)))
    }

    fn build_with_sink<K>(self, sink: K) -> Projector<S, K> {
        let engine = Engine::new(
            self.name,
            self.query.unwrap_or_else(|| QuerySpec::Streams(Vec::new())),
            self.handlers,
            self.init_thunk,
            self.state,
            self.persist_block_size,
        );
        Projector::new(
            engine,
            self.event_store,
            self.control_store,
            sink,
            self.lock_timeout,
            self.update_lock_threshold,
        )
    }
}
