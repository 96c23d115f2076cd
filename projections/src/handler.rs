//! Handler registry (C3): either one catch-all handler, or a mapping from
//! event name to handler — never both.

use composable_rust_core::event_store::StoredEvent;
use composable_rust_core::projection::Result;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A projection handler: folds one event into the current state, producing
/// the next state.
///
/// Boxed as an always-async closure so that both synchronous and
/// asynchronous user handlers fit the same shape (§5: "handlers may be
/// synchronous or asynchronous — both are awaited").
pub type Handler<S> =
    Arc<dyn Fn(&S, &StoredEvent) -> Pin<Box<dyn Future<Output = Result<S>> + Send>> + Send + Sync>;

/// Wrap a plain synchronous fold function as a [`Handler`].
pub fn sync_handler<S, F>(f: F) -> Handler<S>
where
    S: Send + 'static,
    F: Fn(&S, &StoredEvent) -> Result<S> + Send + Sync + 'static,
{
    Arc::new(move |state, event| {
        let result = f(state, event);
        Box::pin(async move { result })
    })
}

/// Either a single catch-all handler, or a mapping keyed by event name.
///
/// Modeled as a tagged variant rather than two optional fields so that the
/// "never both" invariant (C3) is structurally enforced: there is no state
/// representable here where both a catch-all and named handlers exist.
pub enum HandlerRegistry<S> {
    /// Every event, regardless of name, goes through this handler.
    CatchAll(Handler<S>),
    /// Events are dispatched by `event.name`; events with no matching entry
    /// still advance `streamPositions` (§4.5, "per-event idle poll") but are
    /// not folded.
    Named(HashMap<String, Handler<S>>),
}

impl<S> HandlerRegistry<S> {
    /// The handler that should process `event`, if any.
    #[must_use]
    pub fn handler_for(&self, event: &StoredEvent) -> Option<&Handler<S>> {
        match self {
            HandlerRegistry::CatchAll(handler) => Some(handler),
            HandlerRegistry::Named(handlers) => handlers.get(&event.name),
        }
    }
}
