//! In-memory event store for fast, deterministic projection tests.

use composable_rust_core::event::SerializedEvent;
use composable_rust_core::event_store::{EventStore, EventStoreError, StoredEvent, StreamQuery};
use composable_rust_core::stream::StreamId;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

type Result<T> = std::result::Result<T, EventStoreError>;

/// `HashMap`-backed [`EventStore`] for tests. Every method completes
/// synchronously under the hood; the `Pin<Box<dyn Future>>` wrapping exists
/// only to satisfy the trait's dyn-compatible signature.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<HashMap<String, Vec<StoredEvent>>>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of streams currently known to the store.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl EventStore for InMemoryEventStore {
    fn has_stream(&self, stream: &StreamId) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let name = stream.as_str().to_string();
        Box::pin(async move {
            Ok(self
                .streams
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&name))
        })
    }

    fn create_stream(
        &self,
        stream: &StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = stream.as_str().to_string();
        Box::pin(async move {
            let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
            if streams.contains_key(&name) {
                return Err(EventStoreError::StreamAlreadyExists(StreamId::new(name)));
            }
            streams.insert(name, Vec::new());
            Ok(())
        })
    }

    fn delete_stream(
        &self,
        stream: &StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = stream.as_str().to_string();
        Box::pin(async move {
            let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
            if streams.remove(&name).is_none() {
                return Err(EventStoreError::StreamNotFound(StreamId::new(name)));
            }
            Ok(())
        })
    }

    fn append_to(
        &self,
        stream: &StreamId,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let stream = stream.clone();
        Box::pin(async move {
            let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
            let entry = streams.entry(stream.as_str().to_string()).or_default();
            let mut next_no = entry.last().map_or(1, |e| e.no + 1);
            for event in events {
                entry.push(StoredEvent {
                    no: next_no,
                    name: event.event_type,
                    payload: event.data,
                    stream: stream.clone(),
                    metadata: event.metadata,
                });
                next_no += 1;
            }
            Ok(())
        })
    }

    fn merge_and_load(
        &self,
        queries: Vec<StreamQuery>,
    ) -> Pin<
        Box<dyn Future<Output = Result<BoxStream<'static, Result<StoredEvent>>>> + Send + '_>,
    > {
        Box::pin(async move {
            let streams = self.streams.read().unwrap_or_else(|e| e.into_inner());
            let mut matched: Vec<StoredEvent> = Vec::new();
            for query in &queries {
                let candidates: Vec<(&String, &Vec<StoredEvent>)> = match &query.stream {
                    Some(id) => streams
                        .get_key_value(id.as_str())
                        .into_iter()
                        .map(|(k, v)| (k, v))
                        .collect(),
                    None => streams.iter().collect(),
                };
                for (_, events) in candidates {
                    for event in events {
                        if event.no < query.from_number {
                            continue;
                        }
                        if let Some(matcher) = &query.matcher {
                            if !matches_metadata(matcher, &event.metadata) {
                                continue;
                            }
                        }
                        matched.push(event.clone());
                    }
                }
            }
            matched.sort_by_key(|e| e.no);
            Ok(stream::iter(matched.into_iter().map(Ok)).boxed())
        })
    }

    fn all_stream_names(&self) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .streams
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .filter(|name| !name.starts_with('$'))
                .cloned()
                .collect())
        })
    }
}

/// A matcher is an opaque JSON predicate; the in-memory store supports the
/// common case of an object whose fields must all equal the event's
/// metadata fields, which is enough to exercise the scenarios in this
/// crate's test suite.
fn matches_metadata(matcher: &serde_json::Value, metadata: &Option<serde_json::Value>) -> bool {
    let Some(object) = matcher.as_object() else {
        return true;
    };
    let Some(metadata) = metadata else {
        return object.is_empty();
    };
    object
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn append_assigns_sequential_numbers() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::new("s");
        store
            .append_to(
                &stream,
                vec![
                    SerializedEvent::new("A".into(), vec![1], None),
                    SerializedEvent::new("B".into(), vec![2], None),
                ],
            )
            .await
            .expect("append should succeed");

        let events: Vec<_> = store
            .merge_and_load(vec![StreamQuery {
                stream: Some(stream),
                from_number: 1,
                matcher: None,
            }])
            .await
            .expect("merge_and_load should succeed")
            .collect::<Vec<_>>()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().no, 1);
        assert_eq!(events[1].as_ref().unwrap().no, 2);
    }

    #[tokio::test]
    async fn from_number_filters_out_already_seen_events() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::new("s");
        store
            .append_to(
                &stream,
                (1..=5)
                    .map(|i| SerializedEvent::new(format!("E{i}"), vec![i], None))
                    .collect(),
            )
            .await
            .expect("append should succeed");

        let events: Vec<_> = store
            .merge_and_load(vec![StreamQuery {
                stream: Some(stream),
                from_number: 3,
                matcher: None,
            }])
            .await
            .expect("merge_and_load should succeed")
            .collect::<Vec<_>>()
            .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].as_ref().unwrap().no, 3);
    }

    #[tokio::test]
    async fn create_stream_twice_errors() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::new("s");
        store.create_stream(&stream).await.unwrap();
        let err = store.create_stream(&stream).await.unwrap_err();
        assert!(matches!(err, EventStoreError::StreamAlreadyExists(_)));
    }

    #[tokio::test]
    async fn all_stream_names_excludes_internal_streams() {
        let store = InMemoryEventStore::new();
        store.create_stream(&StreamId::new("orders")).await.unwrap();
        store.create_stream(&StreamId::new("$checkpoints")).await.unwrap();

        let names = store.all_stream_names().await.unwrap();
        assert_eq!(names, vec!["orders".to_string()]);
    }
}
