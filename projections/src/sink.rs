//! Sink capability (C7/C8): the hook points that differ between the plain
//! projector and the read-model projector.
//!
//! §9 ("Variants over inheritance"): the plain and read-model projectors
//! share ~80% of their behavior. Rather than model them as a class
//! hierarchy, a shared `Engine` drives the loop and delegates the
//! variant-specific bits to a small `Sink` capability.

use composable_rust_core::event_store::EventStore;
use composable_rust_core::projection::Result;
use composable_rust_core::stream::StreamId;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The hook points a projection variant supplies to the shared engine.
///
/// Default methods are no-ops so the plain projector (which only needs
/// `on_delete`) doesn't have to restate the others.
pub trait Sink<S>: Send + Sync {
    /// Runs once, before the main loop, if the variant has something to
    /// initialize (C8: `readModel.init()` when not already initialized).
    fn on_init(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Runs as part of every checkpoint write, before the control row is
    /// persisted (C8: `readModel.persist()` — "the checkpoint never claims
    /// progress that hasn't been externalized", §7).
    fn on_persist(&self, _state: &S) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Runs as part of `reset()` (C8: `readModel.reset()`).
    fn on_reset(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Runs as part of `delete()`. `delete_target` carries the
    /// variant-specific sense of the delete flag: for the plain projector,
    /// whether to delete the emitted-events stream; for the read-model
    /// projector, whether to delete the read model (§4.6, §9 — the two
    /// variants' flags have different defaults and this implementation
    /// keeps them as two distinct named parameters rather than inheriting
    /// one shared default).
    fn on_delete(&self, delete_target: bool) -> BoxFuture<'_, Result<()>>;
}

/// Read model lifecycle, implemented by user code (§6, "Read model
/// (consumed, C8 only)").
pub trait ReadModel: Send + Sync {
    /// Provision the read model's storage (tables, indexes, ...).
    fn init(&self) -> BoxFuture<'_, Result<()>>;

    /// Whether `init` has already run.
    fn is_initialized(&self) -> BoxFuture<'_, Result<bool>>;

    /// Externalize the read model's current state.
    fn persist(&self) -> BoxFuture<'_, Result<()>>;

    /// Clear the read model back to its initial state.
    fn reset(&self) -> BoxFuture<'_, Result<()>>;

    /// Tear down the read model's storage.
    fn delete(&self) -> BoxFuture<'_, Result<()>>;
}

/// The plain projector's sink: no read model. `on_delete` best-effort
/// deletes the projection's own emitted-events stream when `delete_target`
/// is set (§4.5: "deletes the projection's own emitted-events stream when
/// `delete_projection` is true").
pub struct PlainSink {
    event_store: Arc<dyn EventStore>,
    stream: StreamId,
}

impl PlainSink {
    /// Build a plain sink for a projection whose emitted-events stream is
    /// named after `stream`.
    #[must_use]
    pub fn new(event_store: Arc<dyn EventStore>, stream: StreamId) -> Self {
        Self { event_store, stream }
    }
}

impl<S: Send + Sync> Sink<S> for PlainSink {
    fn on_delete(&self, delete_target: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if delete_target {
                if let Err(error) = self.event_store.delete_stream(&self.stream).await {
                    tracing::warn!(
                        stream = %self.stream,
                        %error,
                        "failed to delete emitted-events stream"
                    );
                }
            }
            Ok(())
        })
    }
}

/// The read-model projector's sink: drives a user-supplied [`ReadModel`]
/// through its lifecycle alongside the engine's own control-row updates.
pub struct ReadModelSink<R> {
    read_model: R,
}

impl<R> ReadModelSink<R> {
    /// Wrap a read model implementation.
    #[must_use]
    pub const fn new(read_model: R) -> Self {
        Self { read_model }
    }

    /// Access the wrapped read model.
    #[must_use]
    pub const fn read_model(&self) -> &R {
        &self.read_model
    }
}

impl<S, R> Sink<S> for ReadModelSink<R>
where
    S: Send + Sync,
    R: ReadModel,
{
    fn on_init(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.read_model.is_initialized().await? {
                self.read_model.init().await?;
            }
            Ok(())
        })
    }

    fn on_persist(&self, _state: &S) -> BoxFuture<'_, Result<()>> {
        self.read_model.persist()
    }

    fn on_reset(&self) -> BoxFuture<'_, Result<()>> {
        self.read_model.reset()
    }

    fn on_delete(&self, delete_target: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if delete_target {
                self.read_model.delete().await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingReadModel {
        initialized: Arc<AtomicBool>,
        persisted: Arc<AtomicBool>,
        reset_called: Arc<AtomicBool>,
        deleted: Arc<AtomicBool>,
    }

    impl ReadModel for RecordingReadModel {
        fn init(&self) -> BoxFuture<'_, Result<()>> {
            self.initialized.store(true, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn is_initialized(&self) -> BoxFuture<'_, Result<bool>> {
            let value = self.initialized.load(Ordering::SeqCst);
            Box::pin(async move { Ok(value) })
        }

        fn persist(&self) -> BoxFuture<'_, Result<()>> {
            self.persisted.store(true, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn reset(&self) -> BoxFuture<'_, Result<()>> {
            self.reset_called.store(true, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn delete(&self) -> BoxFuture<'_, Result<()>> {
            self.deleted.store(true, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn on_init_skips_already_initialized_read_model() {
        let read_model = RecordingReadModel::default();
        read_model.initialized.store(true, Ordering::SeqCst);
        let sink = ReadModelSink::new(read_model.clone());

        Sink::<()>::on_init(&sink).await.unwrap();
        assert!(!read_model.persisted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn on_init_initializes_when_not_already() {
        let read_model = RecordingReadModel::default();
        let sink = ReadModelSink::new(read_model.clone());

        Sink::<()>::on_init(&sink).await.unwrap();
        assert!(read_model.initialized.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn on_delete_is_a_no_op_when_flag_false() {
        let read_model = RecordingReadModel::default();
        let sink = ReadModelSink::new(read_model.clone());

        Sink::<()>::on_delete(&sink, false).await.unwrap();
        assert!(!read_model.deleted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn plain_sink_skips_deletion_when_flag_false() {
        let event_store: Arc<dyn EventStore> = Arc::new(composable_rust_testing::InMemoryEventStore::new());
        let stream = StreamId::new("p");
        event_store.create_stream(&stream).await.unwrap();
        let sink = PlainSink::new(event_store.clone(), stream.clone());

        Sink::<()>::on_delete(&sink, false).await.unwrap();
        assert!(event_store.has_stream(&stream).await.unwrap());
    }

    #[tokio::test]
    async fn plain_sink_deletes_its_stream_when_flag_true() {
        let event_store: Arc<dyn EventStore> = Arc::new(composable_rust_testing::InMemoryEventStore::new());
        let stream = StreamId::new("p");
        event_store.create_stream(&stream).await.unwrap();
        let sink = PlainSink::new(event_store.clone(), stream.clone());

        Sink::<()>::on_delete(&sink, true).await.unwrap();
        assert!(!event_store.has_stream(&stream).await.unwrap());
    }

    #[tokio::test]
    async fn plain_sink_delete_is_best_effort_when_stream_missing() {
        let event_store: Arc<dyn EventStore> = Arc::new(composable_rust_testing::InMemoryEventStore::new());
        let sink = PlainSink::new(event_store, StreamId::new("never-emitted"));

        Sink::<()>::on_delete(&sink, true).await.unwrap();
    }
}
