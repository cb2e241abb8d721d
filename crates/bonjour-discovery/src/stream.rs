//! Subscriber-facing event stream.

use crate::session::{SessionKey, Unsubscribe};
use bonjour_core::{DiscoveryError, DiscoveryEvent};
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Membership of one stream in a discovery session.
pub(crate) struct Subscription {
    registry: Arc<dyn Unsubscribe>,
    key: SessionKey,
    session_id: u64,
    subscriber_id: u64,
}

impl Subscription {
    pub(crate) fn new(
        registry: Arc<dyn Unsubscribe>,
        key: SessionKey,
        session_id: u64,
        subscriber_id: u64,
    ) -> Self {
        Self {
            registry,
            key,
            session_id,
            subscriber_id,
        }
    }
}

/// Stream of discovery events for one subscriber.
///
/// Yields `Ok(event)` items until the session fails, in which case the last
/// item is the error and the stream ends. Dropping the stream (or calling
/// [`DiscoveryStream::cancel`]) unsubscribes; the driver is stopped when the
/// last subscriber of a service type goes away.
pub struct DiscoveryStream {
    events: mpsc::UnboundedReceiver<Result<DiscoveryEvent, DiscoveryError>>,
    subscription: Option<Subscription>,
}

impl DiscoveryStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<Result<DiscoveryEvent, DiscoveryError>>,
        subscription: Subscription,
    ) -> Self {
        Self {
            events,
            subscription: Some(subscription),
        }
    }

    /// A stream that yields `err` and ends, attached to no session.
    pub(crate) fn failed(err: DiscoveryError) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let _ = tx.send(Err(err));
        Self {
            events,
            subscription: None,
        }
    }

    /// Service type this stream is subscribed to, if attached to a session.
    pub fn service_type(&self) -> Option<&str> {
        self.subscription
            .as_ref()
            .map(|subscription| subscription.key.service_type.as_str())
    }

    /// Unsubscribes. Same as dropping the stream.
    pub fn cancel(self) {}
}

impl Stream for DiscoveryStream {
    type Item = Result<DiscoveryEvent, DiscoveryError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for DiscoveryStream {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.registry.unsubscribe(
                &subscription.key,
                subscription.session_id,
                subscription.subscriber_id,
            );
        }
    }
}

impl fmt::Debug for DiscoveryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryStream")
            .field("service_type", &self.service_type())
            .finish()
    }
}
