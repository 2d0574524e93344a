//! The publish/subscribe boundary.
//!
//! devcast never talks to a concrete pub/sub stack directly. Everything it
//! needs is the [`Transport`] trait: publish bytes on a topic, read bytes
//! from a topic, and hear about readers matching or leaving a topic.
//!
//! Registrations are returned as [`Subscription`] guards. Dropping the guard
//! cancels the registration, which makes teardown order follow ownership.

use bytes::Bytes;
use devcast_types::DevcastError;
use tokio::sync::mpsc;

/// A reader appeared on (`change > 0`) or left (`change < 0`) a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchEvent {
    pub topic: String,
    /// Identifier of the reader that triggered the event.
    pub reader: String,
    /// Readers matched on the topic after this event.
    pub current_count: usize,
    pub change: i32,
}

pub type MatchCallback = Box<dyn Fn(&MatchEvent) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(Bytes) + Send + Sync>;

/// Every pub/sub backend must implement this trait.
///
/// # Contract
///
/// * `publish` – hand `payload` to every reader of `topic`. Returns how many
///   readers received it; zero readers is not an error.
/// * `subscribe` – become a reader of `topic`; bytes arrive on the returned
///   [`TopicReceiver`]. Match callbacks on `topic` see the new reader.
/// * `on_subscriber_matched` – hear about readers of `topic`. Readers already
///   present are reported right away.
/// * `on_message` – become a reader of `topic` whose bytes are pushed into
///   `callback` on the transport's delivery thread.
///
/// Callbacks are invoked on transport threads and must hand work off instead
/// of blocking.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, DevcastError>;

    fn subscribe(&self, topic: &str) -> TopicReceiver;

    fn on_subscriber_matched(&self, topic: &str, callback: MatchCallback) -> Subscription;

    fn on_message(&self, topic: &str, callback: MessageCallback) -> Subscription;
}

// ---------------------------------------------------------------------------
// Subscription guard
// ---------------------------------------------------------------------------

/// Cancels a transport registration when dropped.
#[must_use = "dropping a Subscription cancels it immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A guard with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Cancel now rather than at drop.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Reader handle
// ---------------------------------------------------------------------------

/// A reader bound to one topic. Dropping it unmatches the reader.
#[derive(Debug)]
pub struct TopicReceiver {
    topic: String,
    receiver: mpsc::UnboundedReceiver<Bytes>,
    _registration: Subscription,
}

impl TopicReceiver {
    pub fn new(
        topic: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Bytes>,
        registration: Subscription,
    ) -> Self {
        Self {
            topic: topic.into(),
            receiver,
            _registration: registration,
        }
    }

    /// Wait for the next message. `None` once the transport shuts down.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Take a message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.receiver.try_recv().ok()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}
