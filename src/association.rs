//! The link between a live connection and the request it is currently serving.
//!
//! Each connection owns exactly one [`Association`]. A request is associated when it
//! is dispatched on the connection and the association is cleared when the request
//! completes, successfully or not. Terminal errors raised anywhere in the pipeline
//! are delivered through the association, so the request which owns the connection
//! hears about failures that happen before any HTTP data has flowed.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::Error;

/// Terminal lifecycle event for a request.
#[derive(Debug)]
pub enum Event {
    /// The response was delivered to the application handler.
    Success,

    /// The request failed.
    Error(Error),
}

impl Event {
    /// Is this a success event?
    pub fn is_success(&self) -> bool {
        matches!(self, Event::Success)
    }

    /// The error carried by this event, if any.
    pub fn error(&self) -> Option<&Error> {
        match self {
            Event::Success => None,
            Event::Error(error) => Some(error),
        }
    }
}

/// Receives the terminal event for a request.
pub trait EventSink: Send + Sync + 'static {
    /// Deliver a terminal event. Called at most once per dispatched request.
    fn forward(&self, event: Event);
}

impl<F> EventSink for F
where
    F: Fn(Event) + Send + Sync + 'static,
{
    fn forward(&self, event: Event) {
        (self)(event)
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Handle for an in-flight request, used to deliver its terminal event.
#[derive(Clone)]
pub struct RequestHandle {
    id: u64,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle").field("id", &self.id).finish()
    }
}

impl RequestHandle {
    /// Create a handle which forwards events to `sink`.
    pub fn new<S>(sink: S) -> Self
    where
        S: EventSink,
    {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            sink: Arc::new(sink),
        }
    }

    /// Create a handle paired with a future which resolves to its terminal event.
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = oneshot::channel();
        let sink = OneshotSink(Mutex::new(Some(tx)));
        (Self::new(sink), EventReceiver { rx })
    }

    /// Process-unique identifier, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Forward a terminal event to the request.
    pub fn forward(&self, event: Event) {
        tracing::trace!(request = self.id, success = event.is_success(), "terminal event");
        self.sink.forward(event);
    }
}

struct OneshotSink(Mutex<Option<oneshot::Sender<Event>>>);

impl EventSink for OneshotSink {
    fn forward(&self, event: Event) {
        if let Some(tx) = self.0.lock().take() {
            let _ = tx.send(event);
        } else {
            tracing::warn!("terminal event delivered twice to the same request");
        }
    }
}

/// Future resolving to the terminal event of a request created with
/// [`RequestHandle::channel`].
///
/// Resolves to `None` if every copy of the handle was dropped without an event.
#[derive(Debug)]
#[pin_project::pin_project]
pub struct EventReceiver {
    #[pin]
    rx: oneshot::Receiver<Event>,
}

impl Future for EventReceiver {
    type Output = Option<Event>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().rx.poll(cx).map(Result::ok)
    }
}

/// Best-effort sink for errors which may not be attributable to a request.
pub trait DiagnosticSink: Send + Sync + 'static {
    /// Report an error.
    fn report(&self, error: &Error);
}

/// Reports errors to the `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, error: &Error) {
        tracing::error!(%error, "connection error");
    }
}

/// How a terminal error was delivered.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// The associated request received the error.
    Request(u64),

    /// No request was associated; the error is handed back.
    Unclaimed(Error),

    /// The connection had already failed; the error is handed back.
    AlreadyFailed(Error),
}

#[derive(Debug, Default)]
struct Slot {
    current: Option<RequestHandle>,
    failed: bool,
}

/// Per-connection slot holding the request currently using the connection.
///
/// Clones share the same slot. The lock is scoped to one connection, so
/// connections never contend with each other.
#[derive(Clone, Default)]
pub struct Association {
    slot: Arc<Mutex<Slot>>,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("Association")
            .field("current", &slot.current.as_ref().map(RequestHandle::id))
            .field("failed", &slot.failed)
            .finish()
    }
}

impl Association {
    /// Create an unassociated slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a request with the connection.
    ///
    /// Fails with [`Error::Busy`] if another request is associated, or with
    /// [`Error::Closed`] once the connection has failed.
    pub fn associate(&self, handle: RequestHandle) -> Result<(), Error> {
        let mut slot = self.slot.lock();
        if slot.failed {
            return Err(Error::Closed);
        }
        if slot.current.is_some() {
            return Err(Error::Busy);
        }
        tracing::trace!(request = handle.id(), "associated request");
        slot.current = Some(handle);
        Ok(())
    }

    /// The currently associated request, if any.
    pub fn current(&self) -> Option<RequestHandle> {
        self.slot.lock().current.clone()
    }

    /// Is a request currently associated?
    pub fn is_associated(&self) -> bool {
        self.slot.lock().current.is_some()
    }

    /// Has a terminal error been delivered for this connection?
    pub fn is_failed(&self) -> bool {
        self.slot.lock().failed
    }

    /// Remove the current request without notifying it.
    ///
    /// Clearing an unassociated connection is a no-op.
    pub fn clear(&self) -> Option<RequestHandle> {
        self.slot.lock().current.take()
    }

    /// Complete the current request successfully.
    pub fn complete(&self) {
        if let Some(handle) = self.clear() {
            handle.forward(Event::Success);
        }
    }

    /// Fail the current request without failing the connection.
    pub(crate) fn reject(&self, error: Error) -> Delivery {
        match self.clear() {
            Some(handle) => {
                let id = handle.id();
                handle.forward(Event::Error(error));
                Delivery::Request(id)
            }
            None => Delivery::Unclaimed(error),
        }
    }

    /// Deliver a terminal connection error.
    ///
    /// Only the first terminal error is delivered; the connection is marked as
    /// failed and no further requests may be associated.
    pub(crate) fn fail(&self, error: Error) -> Delivery {
        let handle = {
            let mut slot = self.slot.lock();
            if slot.failed {
                return Delivery::AlreadyFailed(error);
            }
            slot.failed = true;
            slot.current.take()
        };

        match handle {
            Some(handle) => {
                let id = handle.id();
                handle.forward(Event::Error(error));
                Delivery::Request(id)
            }
            None => Delivery::Unclaimed(error),
        }
    }

    /// Mark the connection as gone, failing any request still associated with it.
    pub(crate) fn shutdown(&self) {
        let handle = {
            let mut slot = self.slot.lock();
            slot.failed = true;
            slot.current.take()
        };

        if let Some(handle) = handle {
            tracing::debug!(request = handle.id(), "connection closed under request");
            handle.forward(Event::Error(Error::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Association: Send, Sync, Clone);
    assert_impl_all!(RequestHandle: Send, Sync, Clone);
    assert_impl_all!(EventReceiver: Future<Output = Option<Event>>, Send);

    fn counting() -> (RequestHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let events = count.clone();
        let handle = RequestHandle::new(move |_event: Event| {
            events.fetch_add(1, Ordering::SeqCst);
        });
        (handle, count)
    }

    #[test]
    fn clear_is_idempotent() {
        let association = Association::new();
        assert!(association.clear().is_none());
        assert!(association.clear().is_none());

        let (handle, count) = counting();
        association.associate(handle).unwrap();
        assert!(association.clear().is_some());
        assert!(association.clear().is_none());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn one_request_at_a_time() {
        let association = Association::new();
        let (first, _) = counting();
        let (second, _) = counting();

        association.associate(first.clone()).unwrap();
        assert!(matches!(association.associate(second), Err(Error::Busy)));
        assert_eq!(association.current().unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn complete_sends_success_and_clears() {
        let association = Association::new();
        let (handle, event) = RequestHandle::channel();

        association.associate(handle).unwrap();
        association.complete();

        assert!(!association.is_associated());
        assert!(event.await.unwrap().is_success());

        // A new request may use the connection afterwards.
        let (handle, _event) = RequestHandle::channel();
        association.associate(handle).unwrap();
    }

    #[tokio::test]
    async fn fail_delivers_exactly_once() {
        let association = Association::new();
        let (handle, count) = counting();
        association.associate(handle).unwrap();

        assert!(matches!(association.fail(Error::Closed), Delivery::Request(_)));
        assert!(matches!(
            association.fail(Error::Closed),
            Delivery::AlreadyFailed(Error::Closed)
        ));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!association.is_associated());
        assert!(association.is_failed());
    }

    #[test]
    fn failed_connection_refuses_requests() {
        let association = Association::new();
        assert!(matches!(
            association.fail(Error::Closed),
            Delivery::Unclaimed(Error::Closed)
        ));

        let (handle, _) = counting();
        assert!(matches!(association.associate(handle), Err(Error::Closed)));
    }

    #[test]
    fn reject_keeps_connection_usable() {
        let association = Association::new();
        let (handle, count) = counting();
        association.associate(handle).unwrap();

        assert!(matches!(
            association.reject(Error::Handler("nope".into())),
            Delivery::Request(_)
        ));
        assert!(!association.is_failed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_fails_current_request() {
        let association = Association::new();
        let (handle, event) = RequestHandle::channel();
        association.associate(handle).unwrap();

        association.shutdown();
        assert!(matches!(event.await, Some(Event::Error(Error::Closed))));
        assert!(association.is_failed());
    }

    #[tokio::test]
    async fn dropped_handle_resolves_none() {
        let (handle, event) = RequestHandle::channel();
        drop(handle);
        assert!(event.await.is_none());
    }
}
