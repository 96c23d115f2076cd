//! Projection Runner (C7) and Read-Model Projector (C8): `Engine<S>` holds
//! the loop state, `Projector<S, K>` drives it against a shared event store
//! and control-record store.

use crate::builder::InitThunk;
use crate::handler::HandlerRegistry;
use crate::lock::LockManager;
use crate::poller;
use crate::sink::Sink;
use composable_rust_core::event::Event;
use composable_rust_core::event_store::{EventStore, EventStoreError, StoredEvent, StreamQuery};
use composable_rust_core::projection::{
    ControlRecordStore, PositionMap, ProjectionError, ProjectionStatus, QuerySpec, Result,
};
use composable_rust_core::stream::StreamId;
use composable_rust_core::Utc;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn map_event_store_err(error: EventStoreError) -> ProjectionError {
    ProjectionError::Storage(error.to_string())
}

/// Whether a JSON value is the empty-object sentinel a freshly `create`d
/// control row starts with.
///
/// Used to decide whether `load()`'s persisted `state` should overwrite the
/// in-memory working copy seeded by `initThunk`: an empty object means
/// "never persisted", not "persisted as empty".
fn is_never_persisted(value: &serde_json::Value) -> bool {
    matches!(value, serde_json::Value::Object(map) if map.is_empty())
}

/// The loop's in-memory working state (§3, "In-memory runner state").
pub struct Engine<S> {
    name: String,
    query: QuerySpec,
    handlers: Option<HandlerRegistry<S>>,
    init_thunk: Option<InitThunk<S>>,
    state: Option<S>,
    position: PositionMap,
    status: ProjectionStatus,
    stopped: bool,
    event_counter: u64,
    stream_created: bool,
    persist_block_size: u64,
}

impl<S> Engine<S> {
    pub(crate) fn new(
        name: String,
        query: QuerySpec,
        handlers: Option<HandlerRegistry<S>>,
        init_thunk: Option<InitThunk<S>>,
        state: Option<S>,
        persist_block_size: u64,
    ) -> Self {
        Self {
            name,
            query,
            handlers,
            init_thunk,
            state,
            position: PositionMap::new(),
            status: ProjectionStatus::Idle,
            stopped: false,
            event_counter: 0,
            stream_created: false,
            persist_block_size: persist_block_size.max(1),
        }
    }

    /// §4.5 step 1: fail fast on a misconfigured projector.
    fn preflight(&self) -> Result<()> {
        if self.handlers.is_none() {
            return Err(ProjectionError::NoHandler);
        }
        if self.state.is_none() {
            return Err(ProjectionError::StateNotInitialised);
        }
        if matches!(&self.query, QuerySpec::Streams(streams) if streams.is_empty()) {
            return Err(ProjectionError::NoQuery);
        }
        Ok(())
    }
}

/// Drives an [`Engine`] against a shared event store and control-record
/// store, delegating the four variant-specific hook points to `sink`.
pub struct Projector<S, K> {
    engine: Engine<S>,
    event_store: Arc<dyn EventStore>,
    control_store: Arc<dyn ControlRecordStore>,
    lock: LockManager,
    lock_timeout: chrono::Duration,
    sink: K,
    stop_flag: Arc<AtomicBool>,
}

impl<S, K> Projector<S, K>
where
    K: Sink<S>,
{
    pub(crate) fn new(
        engine: Engine<S>,
        event_store: Arc<dyn EventStore>,
        control_store: Arc<dyn ControlRecordStore>,
        sink: K,
        lock_timeout: chrono::Duration,
        update_lock_threshold: chrono::Duration,
    ) -> Self {
        let lock = LockManager::new(control_store.clone(), lock_timeout, update_lock_threshold);
        Self {
            engine,
            event_store,
            control_store,
            lock,
            lock_timeout,
            sink,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The projection's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.engine.name
    }

    /// Current working position map, for inspection in tests.
    #[must_use]
    pub fn position(&self) -> &PositionMap {
        &self.engine.position
    }

    /// Current working state, for inspection in tests.
    #[must_use]
    pub fn state(&self) -> Option<&S> {
        self.engine.state.as_ref()
    }

    /// Signal the loop to stop after the event currently being handled
    /// (§5, "Local" cancellation channel). Safe to call from outside the
    /// task running `run`.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

impl<S, K> Projector<S, K>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
    K: Sink<S> + Send + Sync,
{
    /// Run the projector to completion of one pass (`keep_running = false`)
    /// or indefinitely until stopped (`keep_running = true`).
    ///
    /// Implements §4.5 steps 1–9.
    ///
    /// # Errors
    ///
    /// Returns the documented [`ProjectionError`] variants; see module docs.
    pub async fn run(&mut self, keep_running: bool) -> Result<()> {
        self.engine.preflight()?;

        if self.pretransition(keep_running).await? {
            return Ok(());
        }

        if !self.control_store.exists(&self.engine.name).await? {
            self.control_store
                .create(&self.engine.name, ProjectionStatus::Idle)
                .await?;
        }

        self.lock.acquire(&self.engine.name).await?;

        let result = self.run_inner(keep_running).await;

        if let Err(error) = self.lock.release(&self.engine.name).await {
            tracing::error!(
                projection = %self.engine.name,
                %error,
                "failed to release lock on exit"
            );
        }

        if let Err(error) = &result {
            tracing::error!(projection = %self.engine.name, %error, "projection run failed");
        }

        result
    }

    async fn pretransition(&mut self, keep_running: bool) -> Result<bool> {
        let status = poller::poll_status(self.control_store.as_ref(), &self.engine.name).await;
        self.engine.status = status;
        match status {
            ProjectionStatus::Stopping => {
                self.load_checkpoint().await?;
                self.engine.stopped = true;
                Ok(true)
            }
            ProjectionStatus::Deleting => {
                self.delete(false).await?;
                Ok(true)
            }
            ProjectionStatus::DeletingInclEmitted => {
                self.delete(true).await?;
                Ok(true)
            }
            ProjectionStatus::Resetting => {
                self.reset().await?;
                if keep_running {
                    self.start_again().await?;
                }
                Ok(false)
            }
            ProjectionStatus::Idle | ProjectionStatus::Running => Ok(false),
        }
    }

    async fn run_inner(&mut self, keep_running: bool) -> Result<()> {
        self.sink.on_init().await?;
        self.prepare_positions().await?;
        self.load_checkpoint().await?;

        loop {
            self.run_pass().await?;

            if self.dispatch_loop_status(keep_running).await? {
                break;
            }

            self.prepare_positions().await?;

            if self.stop_flag.load(Ordering::Relaxed) {
                self.engine.stopped = true;
            }

            if self.engine.stopped || !keep_running {
                break;
            }
        }
        Ok(())
    }

    /// §4.5 step 8d: re-evaluate remote status between passes. Returns
    /// `true` if the loop should exit now (stop/delete/non-keep-running
    /// reset).
    async fn dispatch_loop_status(&mut self, keep_running: bool) -> Result<bool> {
        let status = poller::poll_status(self.control_store.as_ref(), &self.engine.name).await;
        self.engine.status = status;
        match status {
            ProjectionStatus::Stopping => {
                self.engine.stopped = true;
                Ok(true)
            }
            ProjectionStatus::Deleting => {
                self.delete(false).await?;
                Ok(true)
            }
            ProjectionStatus::DeletingInclEmitted => {
                self.delete(true).await?;
                Ok(true)
            }
            ProjectionStatus::Resetting => {
                self.reset().await?;
                if keep_running {
                    self.start_again().await?;
                }
                Ok(false)
            }
            ProjectionStatus::Idle | ProjectionStatus::Running => Ok(false),
        }
    }

    /// §4.5 step 8 a–c: one merge-load pass over the current positions.
    async fn run_pass(&mut self) -> Result<()> {
        let queries = self.build_queries();
        let mut events = self
            .event_store
            .merge_and_load(queries)
            .await
            .map_err(map_event_store_err)?;

        self.engine.event_counter = 0;

        while let Some(event) = events.next().await {
            let event = event.map_err(map_event_store_err)?;
            self.apply_event(&event).await?;
            self.engine.event_counter += 1;

            if self.engine.event_counter % self.engine.persist_block_size == 0 {
                self.checkpoint().await?;
                if self.check_stopping_mid_batch().await? {
                    break;
                }
            }

            if self.stop_flag.load(Ordering::Relaxed) {
                self.engine.stopped = true;
                break;
            }
        }

        if self.engine.event_counter == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            self.lock.maybe_refresh(&self.engine.name).await?;
        } else {
            self.checkpoint().await?;
        }
        self.engine.event_counter = 0;
        Ok(())
    }

    /// Mid-batch status check (§4.5 step 8b, "at every `persistBlockSize`
    /// events ... re-fetch status"). Only the `stopping` transition is acted
    /// on here, matching the one mid-batch scenario the spec tests; the full
    /// dispatch table runs at pass boundaries (`dispatch_loop_status`).
    async fn check_stopping_mid_batch(&mut self) -> Result<bool> {
        let status = poller::poll_status(self.control_store.as_ref(), &self.engine.name).await;
        self.engine.status = status;
        if status == ProjectionStatus::Stopping {
            self.engine.stopped = true;
            return Ok(true);
        }
        Ok(false)
    }

    async fn apply_event(&mut self, event: &StoredEvent) -> Result<()> {
        self.engine.position.set(event.stream.clone(), event.no);

        let handlers = self.engine.handlers.as_ref().ok_or(ProjectionError::NoHandler)?;
        if let Some(handler) = handlers.handler_for(event) {
            let current = self
                .engine
                .state
                .as_ref()
                .ok_or(ProjectionError::StateNotInitialised)?;
            let next = (handler)(current, event).await?;
            self.engine.state = Some(next);
        }
        Ok(())
    }

    fn build_queries(&self) -> Vec<StreamQuery> {
        match &self.engine.query {
            QuerySpec::All => self
                .engine
                .position
                .iter()
                .map(|(stream, no)| StreamQuery {
                    stream: Some(stream.clone()),
                    from_number: no + 1,
                    matcher: None,
                })
                .collect(),
            QuerySpec::Streams(specs) => specs
                .iter()
                .map(|(stream, matcher)| StreamQuery {
                    stream: Some(stream.clone()),
                    from_number: self.engine.position.get(stream) + 1,
                    matcher: matcher.clone(),
                })
                .collect(),
        }
    }

    /// §4.5 position preparation: seed every stream the query names (or, for
    /// `queryAll`, every stream the event store currently knows about) to
    /// `0`, without disturbing positions already recorded.
    async fn prepare_positions(&mut self) -> Result<()> {
        let streams: Vec<StreamId> = match &self.engine.query {
            QuerySpec::All => self
                .event_store
                .all_stream_names()
                .await
                .map_err(map_event_store_err)?
                .into_iter()
                .map(StreamId::new)
                .collect(),
            QuerySpec::Streams(specs) => specs.iter().map(|(stream, _)| stream.clone()).collect(),
        };
        for stream in streams {
            self.engine.position.seed_missing(stream);
        }
        Ok(())
    }

    /// §4.2 `load`: overlay persisted position and state onto the working
    /// copies. Persisted positions always win; persisted state only wins if
    /// the row has actually been written to before (`is_never_persisted`
    /// guards the freshly-`create`d `{}` sentinel).
    async fn load_checkpoint(&mut self) -> Result<()> {
        let (position, state_json) = self.control_store.load(&self.engine.name).await?;
        for (stream, no) in position.iter() {
            self.engine.position.set(stream.clone(), *no);
        }
        if !is_never_persisted(&state_json) {
            let state: S = serde_json::from_value(state_json)
                .map_err(|e| ProjectionError::Serialization(e.to_string()))?;
            self.engine.state = Some(state);
        }
        Ok(())
    }

    fn state_as_json(&self) -> Result<serde_json::Value> {
        let state = self
            .engine
            .state
            .as_ref()
            .ok_or(ProjectionError::StateNotInitialised)?;
        serde_json::to_value(state).map_err(|e| ProjectionError::Serialization(e.to_string()))
    }

    /// The canonical checkpoint write (§4.2 `persist`): externalizes the
    /// read model (if any) first, then writes position/state/lease in one
    /// statement (§4.6: "the checkpoint never claims progress that hasn't
    /// been externalized").
    async fn checkpoint(&mut self) -> Result<()> {
        {
            let state = self
                .engine
                .state
                .as_ref()
                .ok_or(ProjectionError::StateNotInitialised)?;
            self.sink.on_persist(state).await?;
        }
        let state_json = self.state_as_json()?;
        let locked_until = Utc::now() + self.lock_timeout;
        self.control_store
            .persist(&self.engine.name, locked_until, &state_json, &self.engine.position)
            .await?;
        Ok(())
    }

    async fn start_again(&mut self) -> Result<()> {
        self.control_store
            .update_status(&self.engine.name, ProjectionStatus::Running)
            .await?;
        self.engine.status = ProjectionStatus::Running;
        self.engine.stopped = false;
        Ok(())
    }

    /// §4.6/§7 `reset`: zero positions, reinitialize state from `initThunk`,
    /// best-effort delete the emitted-events stream (failure logged, never
    /// fatal), run the sink's own reset hook, then persist.
    ///
    /// # Errors
    ///
    /// Propagates control-store errors; does NOT propagate emitted-stream
    /// deletion errors (logged at `tracing::warn!` instead, per §7).
    pub async fn reset(&mut self) -> Result<()> {
        self.engine.position.clear();
        if let Some(thunk) = self.engine.init_thunk.clone() {
            self.engine.state = Some((thunk)());
        }
        self.engine.event_counter = 0;
        self.engine.stream_created = false;

        let own_stream = StreamId::new(self.engine.name.clone());
        if let Err(error) = self.event_store.delete_stream(&own_stream).await {
            tracing::warn!(
                projection = %self.engine.name,
                %error,
                "failed to delete emitted-events stream during reset"
            );
        }

        self.sink.on_reset().await?;

        let state_json = self.state_as_json()?;
        // Unlike `checkpoint`'s persist, no lease is held here yet (`reset`
        // runs from `pretransition`, before this pass's `lock.acquire`) — an
        // already-elapsed timestamp keeps the row immediately acquirable
        // rather than locking this runner out of its own lease.
        self.control_store
            .persist(&self.engine.name, Utc::now(), &state_json, &self.engine.position)
            .await?;
        self.control_store
            .update_status(&self.engine.name, ProjectionStatus::Idle)
            .await?;
        self.engine.status = ProjectionStatus::Idle;
        Ok(())
    }

    /// §4.6/§9 `delete`: runs the sink's variant-specific deletion (the
    /// emitted-events stream for the plain projector, the read model for
    /// the read-model projector) then removes the control row.
    ///
    /// # Errors
    ///
    /// Propagates [`ProjectionError::ProjectionNotFound`] if the control row
    /// was already gone.
    pub async fn delete(&mut self, delete_target: bool) -> Result<()> {
        self.sink.on_delete(delete_target).await?;
        self.control_store.delete_row(&self.engine.name).await?;
        Ok(())
    }

    /// §4.7 `emit`: append to the stream named after this projection,
    /// creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on event-store failure,
    /// [`ProjectionError::Serialization`] if `event` cannot be serialized.
    pub async fn emit<E: Event + Serialize>(&mut self, event: &E) -> Result<()> {
        let stream = StreamId::new(self.engine.name.clone());
        if !self.engine.stream_created {
            self.ensure_stream(&stream).await?;
            self.engine.stream_created = true;
        }
        self.append_serialized(&stream, event).await
    }

    /// §4.7 `linkTo`: append to the caller-named stream, creating it on
    /// first use. Unlike the source this is grounded on, the given stream
    /// argument is honored rather than ignored (§9, documented bug fix).
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on event-store failure,
    /// [`ProjectionError::Serialization`] if `event` cannot be serialized.
    pub async fn link_to<E: Event + Serialize>(&mut self, stream: &str, event: &E) -> Result<()> {
        let stream_id = StreamId::new(stream);
        self.ensure_stream(&stream_id).await?;
        self.append_serialized(&stream_id, event).await
    }

    async fn ensure_stream(&self, stream: &StreamId) -> Result<()> {
        let exists = self
            .event_store
            .has_stream(stream)
            .await
            .map_err(map_event_store_err)?;
        if !exists {
            self.event_store
                .create_stream(stream)
                .await
                .map_err(map_event_store_err)?;
        }
        Ok(())
    }

    async fn append_serialized<E: Event + Serialize>(&self, stream: &StreamId, event: &E) -> Result<()> {
        let serialized = composable_rust_core::event::SerializedEvent::from_event(event, None)
            .map_err(|e| ProjectionError::Serialization(e.to_string()))?;
        self.event_store
            .append_to(stream, vec![serialized])
            .await
            .map_err(map_event_store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProjectionBuilder;
    use crate::handler::sync_handler;
    use composable_rust_core::event::{Event, SerializedEvent};
    use composable_rust_testing::{InMemoryControlRecordStore, InMemoryEventStore};
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counts {
        a: u32,
        b: u32,
        c: u32,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Tick;

    impl Event for Tick {
        fn event_type(&self) -> &'static str {
            "Tick.v1"
        }
    }

    async fn append_named(store: &InMemoryEventStore, stream: &str, names: &[&str]) {
        let events = names
            .iter()
            .map(|name| SerializedEvent::new((*name).to_string(), vec![], None))
            .collect();
        store
            .append_to(&StreamId::new(stream), events)
            .await
            .expect("append should succeed");
    }

    #[tokio::test]
    async fn preflight_rejects_missing_handler() {
        let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(InMemoryControlRecordStore::new());
        let mut projector = ProjectionBuilder::<Counts>::new("p", event_store, control_store)
            .init(Counts::default)
            .unwrap()
            .from_all()
            .unwrap()
            .build()
            .unwrap();

        let err = projector.run(false).await.unwrap_err();
        assert!(matches!(err, ProjectionError::NoHandler));
    }

    #[tokio::test]
    async fn preflight_rejects_missing_state() {
        let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(InMemoryControlRecordStore::new());
        let mut projector = ProjectionBuilder::<Counts>::new("p", event_store, control_store)
            .from_all()
            .unwrap()
            .when_any(sync_handler(|s: &Counts, _| Ok(s.clone())))
            .unwrap()
            .build()
            .unwrap();

        let err = projector.run(false).await.unwrap_err();
        assert!(matches!(err, ProjectionError::StateNotInitialised));
    }

    #[tokio::test]
    async fn preflight_rejects_unconfigured_query() {
        let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(InMemoryControlRecordStore::new());
        let mut projector = ProjectionBuilder::<Counts>::new("p", event_store, control_store)
            .init(Counts::default)
            .unwrap()
            .when_any(sync_handler(|s: &Counts, _| Ok(s.clone())))
            .unwrap()
            .build()
            .unwrap();

        let err = projector.run(false).await.unwrap_err();
        assert!(matches!(err, ProjectionError::NoQuery));
    }

    #[tokio::test]
    async fn preflight_rejects_explicit_empty_stream_list() {
        let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(InMemoryControlRecordStore::new());
        let mut projector = ProjectionBuilder::<Counts>::new("p", event_store, control_store)
            .init(Counts::default)
            .unwrap()
            .from_streams(Vec::new())
            .unwrap()
            .when_any(sync_handler(|s: &Counts, _| Ok(s.clone())))
            .unwrap()
            .build()
            .unwrap();

        let err = projector.run(false).await.unwrap_err();
        assert!(matches!(err, ProjectionError::NoQuery));
    }

    #[tokio::test]
    async fn fresh_run_single_stream_named_handlers() {
        let event_store = InMemoryEventStore::new();
        append_named(&event_store, "s", &["A", "B", "C"]).await;
        let event_store: Arc<dyn EventStore> = Arc::new(event_store);
        let control_store = InMemoryControlRecordStore::new();
        let control_store_handle = control_store.clone();
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(control_store);

        let mut handlers: HashMap<String, crate::handler::Handler<Counts>> = HashMap::new();
        handlers.insert(
            "A".to_string(),
            sync_handler(|s: &Counts, _| {
                let mut next = s.clone();
                next.a += 1;
                Ok(next)
            }),
        );
        handlers.insert(
            "B".to_string(),
            sync_handler(|s: &Counts, _| {
                let mut next = s.clone();
                next.b += 1;
                Ok(next)
            }),
        );

        let mut projector = ProjectionBuilder::new("p", event_store, control_store.clone())
            .init(Counts::default)
            .unwrap()
            .from_stream(StreamId::new("s"), None)
            .unwrap()
            .when(handlers)
            .unwrap()
            .build()
            .unwrap();

        projector.run(false).await.expect("run should succeed");

        assert_eq!(projector.state(), Some(&Counts { a: 1, b: 1, c: 0 }));
        assert_eq!(projector.position().get(&StreamId::new("s")), 3);

        let row = control_store_handle.snapshot("p").unwrap();
        assert_eq!(row.position.get(&StreamId::new("s")), 3);
        assert_eq!(row.status, ProjectionStatus::Idle);
        assert!(row.locked_until.is_none());
    }

    #[tokio::test]
    async fn catch_all_multi_stream_merge() {
        let event_store = InMemoryEventStore::new();
        append_named(&event_store, "u", &["U1", "U2"]).await;
        append_named(&event_store, "c", &["C1"]).await;
        let event_store: Arc<dyn EventStore> = Arc::new(event_store);
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(InMemoryControlRecordStore::new());

        let mut projector = ProjectionBuilder::new("merge", event_store, control_store)
            .init(Vec::<String>::new)
            .unwrap()
            .from_streams(vec![(StreamId::new("u"), None), (StreamId::new("c"), None)])
            .unwrap()
            .when_any(sync_handler(|seen: &Vec<String>, event| {
                let mut next = seen.clone();
                next.push(event.name.clone());
                Ok(next)
            }))
            .unwrap()
            .build()
            .unwrap();

        projector.run(false).await.expect("run should succeed");

        assert_eq!(projector.position().get(&StreamId::new("u")), 2);
        assert_eq!(projector.position().get(&StreamId::new("c")), 1);
        let state = projector.state().unwrap();
        assert_eq!(state.len(), 3);
    }

    #[tokio::test]
    async fn resumes_from_seeded_checkpoint() {
        let event_store = InMemoryEventStore::new();
        for i in 1..=5 {
            append_named(&event_store, "s", &[&format!("E{i}")]).await;
        }
        let event_store: Arc<dyn EventStore> = Arc::new(event_store);
        let control_store = InMemoryControlRecordStore::new();

        let mut position = PositionMap::new();
        position.set(StreamId::new("s"), 2);
        control_store.seed(composable_rust_core::projection::ControlRecord {
            name: "resume".to_string(),
            position,
            state: serde_json::json!({ "seen": 2 }),
            status: ProjectionStatus::Idle,
            locked_until: None,
        });
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(control_store);

        #[derive(Clone, Debug, Default, Serialize, Deserialize)]
        struct Seen {
            seen: u64,
        }

        let mut projector = ProjectionBuilder::new("resume", event_store, control_store)
            .init(Seen::default)
            .unwrap()
            .from_stream(StreamId::new("s"), None)
            .unwrap()
            .when_any(sync_handler(|s: &Seen, _| Ok(Seen { seen: s.seen + 1 })))
            .unwrap()
            .build()
            .unwrap();

        projector.run(false).await.expect("run should succeed");

        assert_eq!(projector.state().unwrap().seen, 5);
        assert_eq!(projector.position().get(&StreamId::new("s")), 5);
    }

    /// Scenario 4: an operator flips status to `stopping` mid-batch. With
    /// `persist_block_size(2)`, the mid-batch status check after the first
    /// checkpoint should see it and stop before the remaining events are
    /// consumed. The handler flips the row directly (synchronously, via
    /// `seed`) rather than racing a spawned task against the loop.
    #[tokio::test]
    async fn remote_stop_mid_batch_persists_partial_progress() {
        let event_store = InMemoryEventStore::new();
        for i in 1..=6 {
            append_named(&event_store, "s", &[&format!("E{i}")]).await;
        }
        let event_store: Arc<dyn EventStore> = Arc::new(event_store);

        let control_store = InMemoryControlRecordStore::new();
        control_store
            .create("stop-test", ProjectionStatus::Idle)
            .await
            .unwrap();
        let control_for_handler = control_store.clone();
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(control_store);

        let seen = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen_in_handler = seen.clone();

        let mut projector = ProjectionBuilder::new("stop-test", event_store, control_store)
            .init(|| 0u32)
            .unwrap()
            .from_stream(StreamId::new("s"), None)
            .unwrap()
            .persist_block_size(2)
            .when_any(sync_handler(move |n: &u32, _| {
                let count = seen_in_handler.fetch_add(1, Ordering::SeqCst) + 1;
                if count == 2 {
                    if let Some(mut row) = control_for_handler.snapshot("stop-test") {
                        row.status = ProjectionStatus::Stopping;
                        control_for_handler.seed(row);
                    }
                }
                Ok(*n + 1)
            }))
            .unwrap()
            .build()
            .unwrap();

        projector.run(true).await.expect("run should stop cleanly");

        assert_eq!(projector.state(), Some(&2));
        assert_eq!(projector.position().get(&StreamId::new("s")), 2);
    }

    #[tokio::test]
    async fn emit_writes_to_own_stream_and_link_to_honors_its_argument() {
        let event_store = InMemoryEventStore::new();
        let event_store: Arc<dyn EventStore> = Arc::new(event_store);
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(InMemoryControlRecordStore::new());

        let mut projector = ProjectionBuilder::new("emitter", event_store.clone(), control_store)
            .init(|| 0u32)
            .unwrap()
            .from_all()
            .unwrap()
            .when_any(sync_handler(|n: &u32, _| Ok(*n + 1)))
            .unwrap()
            .build()
            .unwrap();

        projector.emit(&Tick).await.expect("emit should succeed");
        projector.emit(&Tick).await.expect("second emit should reuse the cached stream");
        projector
            .link_to("audit-log", &Tick)
            .await
            .expect("link_to should honor its stream argument");

        assert!(event_store.has_stream(&StreamId::new("emitter")).await.unwrap());
        assert!(event_store.has_stream(&StreamId::new("audit-log")).await.unwrap());

        let own: Vec<_> = event_store
            .merge_and_load(vec![StreamQuery {
                stream: Some(StreamId::new("emitter")),
                from_number: 1,
                matcher: None,
            }])
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        assert_eq!(own.len(), 2);

        let audit: Vec<_> = event_store
            .merge_and_load(vec![StreamQuery {
                stream: Some(StreamId::new("audit-log")),
                from_number: 1,
                matcher: None,
            }])
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn reset_zeroes_state_and_position_and_best_effort_deletes_emitted_stream() {
        let event_store = InMemoryEventStore::new();
        event_store.create_stream(&StreamId::new("s")).await.unwrap();
        append_named(&event_store, "s", &["A"]).await;
        let event_store: Arc<dyn EventStore> = Arc::new(event_store);
        let control_store = InMemoryControlRecordStore::new();
        let control_store_handle = control_store.clone();
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(control_store);

        let mut projector = ProjectionBuilder::new("resettable", event_store, control_store)
            .init(|| 0u32)
            .unwrap()
            .from_stream(StreamId::new("s"), None)
            .unwrap()
            .when_any(sync_handler(|n: &u32, _| Ok(*n + 1)))
            .unwrap()
            .build()
            .unwrap();

        projector.run(false).await.expect("initial run should succeed");
        assert_eq!(projector.state(), Some(&1));

        projector.reset().await.expect("reset should succeed, even with no emitted stream");

        assert_eq!(projector.state(), Some(&0));
        assert!(projector.position().is_empty());

        let row = control_store_handle.snapshot("resettable").unwrap();
        assert_eq!(row.status, ProjectionStatus::Idle);
    }

    /// Scenario 5: the control row is seeded with stale state/positions and
    /// `status = resetting`. `run(true)` must reset, flip back to `running`
    /// via `start_again`, then re-enter the loop and resume from position 0
    /// rather than the pre-reset positions. The handler flips the row to
    /// `stopping` once both post-reset events are seen, so the test
    /// terminates deterministically without racing a background task.
    #[tokio::test]
    async fn reset_with_keep_running_resumes_from_zero() {
        #[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
        struct N {
            n: u32,
        }

        let event_store = InMemoryEventStore::new();
        append_named(&event_store, "s", &["E1", "E2"]).await;
        let event_store: Arc<dyn EventStore> = Arc::new(event_store);

        let control_store = InMemoryControlRecordStore::new();
        let mut stale_position = PositionMap::new();
        stale_position.set(StreamId::new("s"), 10);
        control_store.seed(composable_rust_core::projection::ControlRecord {
            name: "reset-resume".to_string(),
            position: stale_position,
            state: serde_json::json!({ "n": 5 }),
            status: ProjectionStatus::Resetting,
            locked_until: None,
        });
        let control_store_handle = control_store.clone();
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(control_store);

        let seen = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen_in_handler = seen.clone();
        let control_for_handler = control_store_handle.clone();

        let mut projector = ProjectionBuilder::new("reset-resume", event_store, control_store)
            .init(N::default)
            .unwrap()
            .from_stream(StreamId::new("s"), None)
            .unwrap()
            .when_any(sync_handler(move |s: &N, _| {
                let count = seen_in_handler.fetch_add(1, Ordering::SeqCst) + 1;
                if count == 2 {
                    if let Some(mut row) = control_for_handler.snapshot("reset-resume") {
                        row.status = ProjectionStatus::Stopping;
                        control_for_handler.seed(row);
                    }
                }
                Ok(N { n: s.n + 1 })
            }))
            .unwrap()
            .build()
            .unwrap();

        projector
            .run(true)
            .await
            .expect("run should reset, resume, then stop cleanly");

        assert_eq!(projector.state(), Some(&N { n: 2 }));
        assert_eq!(projector.position().get(&StreamId::new("s")), 2);

        let row = control_store_handle.snapshot("reset-resume").unwrap();
        assert_eq!(row.status, ProjectionStatus::Idle);
    }

    /// `resetting` with `keepRunning = false` must still fall through into
    /// steps 3-9 for one pass (spec.md's `do...while` body always runs
    /// once), not return immediately after `reset()`. Seeds stale
    /// state/position and `status = resetting`, then drives `run(false)`
    /// once: the post-reset pass must process both events from position 0.
    #[tokio::test]
    async fn reset_without_keep_running_still_runs_one_pass() {
        #[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
        struct N {
            n: u32,
        }

        let event_store = InMemoryEventStore::new();
        append_named(&event_store, "s", &["E1", "E2"]).await;
        let event_store: Arc<dyn EventStore> = Arc::new(event_store);

        let control_store = InMemoryControlRecordStore::new();
        let mut stale_position = PositionMap::new();
        stale_position.set(StreamId::new("s"), 10);
        control_store.seed(composable_rust_core::projection::ControlRecord {
            name: "reset-no-keep-running".to_string(),
            position: stale_position,
            state: serde_json::json!({ "n": 5 }),
            status: ProjectionStatus::Resetting,
            locked_until: None,
        });
        let control_store_handle = control_store.clone();
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(control_store);

        let mut projector = ProjectionBuilder::new("reset-no-keep-running", event_store, control_store)
            .init(N::default)
            .unwrap()
            .from_stream(StreamId::new("s"), None)
            .unwrap()
            .when_any(sync_handler(|s: &N, _| Ok(N { n: s.n + 1 })))
            .unwrap()
            .build()
            .unwrap();

        projector
            .run(false)
            .await
            .expect("run should reset then still complete one pass");

        assert_eq!(projector.state(), Some(&N { n: 2 }));
        assert_eq!(projector.position().get(&StreamId::new("s")), 2);

        let row = control_store_handle.snapshot("reset-no-keep-running").unwrap();
        assert_eq!(row.status, ProjectionStatus::Idle);
    }

    /// Scenario 6: with `updateLockThreshold = 0`, every idle pass refreshes
    /// the lease. Calls `run_pass` directly (rather than driving `run`
    /// indefinitely) so the test terminates without needing an external
    /// stop signal.
    #[tokio::test]
    async fn idle_poll_refreshes_lease_and_never_goes_null() {
        let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let control_store = InMemoryControlRecordStore::new();
        control_store.create("idle-test", ProjectionStatus::Idle).await.unwrap();
        let control_store_handle = control_store.clone();
        let control_store: Arc<dyn ControlRecordStore> = Arc::new(control_store);

        let mut projector = ProjectionBuilder::new("idle-test", event_store, control_store)
            .init(|| 0u32)
            .unwrap()
            .from_all()
            .unwrap()
            .when_any(sync_handler(|n: &u32, _| Ok(*n + 1)))
            .unwrap()
            .build()
            .unwrap();

        projector.lock.acquire("idle-test").await.unwrap();

        projector.run_pass().await.unwrap();
        let after_first = control_store_handle
            .snapshot("idle-test")
            .unwrap()
            .locked_until
            .expect("lease should be set after the first idle refresh");

        projector.run_pass().await.unwrap();
        let after_second = control_store_handle
            .snapshot("idle-test")
            .unwrap()
            .locked_until
            .expect("lease should never go null between idle refreshes");

        assert!(after_second > after_first);
    }
}
