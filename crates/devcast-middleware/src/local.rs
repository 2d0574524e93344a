//! In-process [`Transport`] implementation.
//!
//! [`LocalTransport`] routes bytes between publishers and readers living in
//! the same process. It backs the test-suite and the `devcast` demo binary,
//! and it is the reference for how a network backend must behave with
//! respect to reader matching.
//!
//! Every reader gets its own unbounded channel, so a slow reader never
//! blocks a publisher or the other readers. Callbacks registered through
//! [`Transport::on_message`] are invoked on the publishing thread.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use devcast_types::DevcastError;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::transport::{
    MatchCallback, MatchEvent, MessageCallback, Subscription, TopicReceiver, Transport,
};

type SharedMatchCallback = Arc<dyn Fn(&MatchEvent) + Send + Sync>;
type SharedMessageCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

#[derive(Clone)]
enum ReaderSink {
    Channel(mpsc::UnboundedSender<Bytes>),
    Callback(SharedMessageCallback),
}

struct Reader {
    id: u64,
    guid: String,
    sink: ReaderSink,
}

#[derive(Default)]
struct TopicState {
    readers: Vec<Reader>,
    match_callbacks: Vec<(u64, SharedMatchCallback)>,
}

#[derive(Default)]
struct Topics {
    topics: HashMap<String, TopicState>,
    next_id: u64,
    offline: bool,
}

impl Topics {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared in-process transport. Clone it cheaply – all clones share the same
/// topic table.
#[derive(Clone, Default)]
pub struct LocalTransport {
    inner: Arc<Mutex<Topics>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of readers currently matched on `topic`.
    pub fn reader_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map_or(0, |state| state.readers.len())
    }

    /// Simulate a link failure: while offline every publish fails.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    fn add_reader(&self, topic: &str, sink: ReaderSink) -> Subscription {
        let guid = Uuid::new_v4().to_string();
        let (id, events) = {
            let mut topics = self.inner.lock();
            let id = topics.next_id();
            let state = topics.topics.entry(topic.to_string()).or_default();
            state.readers.push(Reader {
                id,
                guid: guid.clone(),
                sink,
            });
            let event = MatchEvent {
                topic: topic.to_string(),
                reader: guid.clone(),
                current_count: state.readers.len(),
                change: 1,
            };
            let callbacks: Vec<SharedMatchCallback> =
                state.match_callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            (id, (callbacks, event))
        };

        debug!(topic, reader = %guid, "reader matched");
        let (callbacks, event) = events;
        for callback in callbacks {
            callback(&event);
        }

        let weak = Arc::downgrade(&self.inner);
        let topic = topic.to_string();
        Subscription::new(move || remove_reader(&weak, &topic, id))
    }
}

fn remove_reader(weak: &Weak<Mutex<Topics>>, topic: &str, id: u64) {
    let Some(inner) = weak.upgrade() else { return };
    let notify = {
        let mut topics = inner.lock();
        let Some(state) = topics.topics.get_mut(topic) else { return };
        let Some(pos) = state.readers.iter().position(|r| r.id == id) else { return };
        let reader = state.readers.remove(pos);
        let event = MatchEvent {
            topic: topic.to_string(),
            reader: reader.guid,
            current_count: state.readers.len(),
            change: -1,
        };
        let callbacks: Vec<SharedMatchCallback> =
            state.match_callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect();
        (callbacks, event)
    };

    debug!(topic, reader = %notify.1.reader, "reader unmatched");
    let (callbacks, event) = notify;
    for callback in callbacks {
        callback(&event);
    }
}

impl Transport for LocalTransport {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, DevcastError> {
        let sinks: Vec<ReaderSink> = {
            let topics = self.inner.lock();
            if topics.offline {
                return Err(DevcastError::Transport {
                    topic: topic.to_string(),
                    details: "transport is offline".to_string(),
                });
            }
            topics
                .topics
                .get(topic)
                .map(|state| state.readers.iter().map(|r| r.sink.clone()).collect())
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for sink in sinks {
            match sink {
                ReaderSink::Channel(tx) => {
                    if tx.send(payload.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                ReaderSink::Callback(callback) => {
                    callback(payload.clone());
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }

    fn subscribe(&self, topic: &str) -> TopicReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = self.add_reader(topic, ReaderSink::Channel(tx));
        TopicReceiver::new(topic, rx, registration)
    }

    fn on_subscriber_matched(&self, topic: &str, callback: MatchCallback) -> Subscription {
        let callback: SharedMatchCallback = Arc::from(callback);
        let (id, existing) = {
            let mut topics = self.inner.lock();
            let id = topics.next_id();
            let state = topics.topics.entry(topic.to_string()).or_default();
            state.match_callbacks.push((id, Arc::clone(&callback)));
            let existing: Vec<MatchEvent> = state
                .readers
                .iter()
                .enumerate()
                .map(|(i, reader)| MatchEvent {
                    topic: topic.to_string(),
                    reader: reader.guid.clone(),
                    current_count: i + 1,
                    change: 1,
                })
                .collect();
            (id, existing)
        };

        for event in &existing {
            callback(event);
        }

        let weak = Arc::downgrade(&self.inner);
        let topic = topic.to_string();
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(state) = inner.lock().topics.get_mut(&topic) {
                    state.match_callbacks.retain(|(cb_id, _)| *cb_id != id);
                }
            }
        })
    }

    fn on_message(&self, topic: &str, callback: MessageCallback) -> Subscription {
        self.add_reader(topic, ReaderSink::Callback(Arc::from(callback)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn publish_reaches_every_reader() -> Result<(), Box<dyn std::error::Error>> {
        let transport = LocalTransport::new();
        let mut r1 = transport.subscribe("dev/notification");
        let mut r2 = transport.subscribe("dev/notification");

        let delivered = transport.publish("dev/notification", Bytes::from_static(b"hello"))?;
        assert_eq!(delivered, 2);
        assert_eq!(r1.recv().await.as_deref(), Some(&b"hello"[..]));
        assert_eq!(r2.recv().await.as_deref(), Some(&b"hello"[..]));
        Ok(())
    }

    #[test]
    fn publish_without_readers_is_not_an_error() {
        let transport = LocalTransport::new();
        assert_eq!(transport.publish("nobody/home", Bytes::new()).ok(), Some(0));
    }

    #[test]
    fn topics_are_isolated() {
        let transport = LocalTransport::new();
        let mut control = transport.subscribe("dev/control");
        transport.publish("dev/depth", Bytes::from_static(b"x")).unwrap();
        assert!(control.try_recv().is_none());
    }

    #[test]
    fn offline_transport_rejects_publish() {
        let transport = LocalTransport::new();
        transport.set_offline(true);
        assert!(matches!(
            transport.publish("dev/depth", Bytes::new()),
            Err(DevcastError::Transport { .. })
        ));
        transport.set_offline(false);
        assert!(transport.publish("dev/depth", Bytes::new()).is_ok());
    }

    #[test]
    fn match_events_follow_reader_lifetime() {
        let transport = LocalTransport::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = transport.on_subscriber_matched(
            "dev/notification",
            Box::new(move |e: &MatchEvent| sink.lock().push((e.change, e.current_count))),
        );

        let reader = transport.subscribe("dev/notification");
        assert_eq!(transport.reader_count("dev/notification"), 1);
        drop(reader);
        assert_eq!(transport.reader_count("dev/notification"), 0);

        assert_eq!(*events.lock(), vec![(1, 1), (-1, 0)]);
    }

    #[test]
    fn existing_readers_are_reported_on_registration() {
        let transport = LocalTransport::new();
        let _a = transport.subscribe("t");
        let _b = transport.subscribe("t");

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _sub = transport.on_subscriber_matched(
            "t",
            Box::new(move |e: &MatchEvent| {
                assert_eq!(e.change, 1);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_match_subscription_stops_events() {
        let transport = LocalTransport::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = transport.on_subscriber_matched(
            "t",
            Box::new(move |_: &MatchEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        drop(sub);
        let _reader = transport.subscribe("t");
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn message_callback_counts_as_reader() {
        let transport = LocalTransport::new();
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        let sub = transport.on_message("dev/control", Box::new(move |b: Bytes| sink.lock().push(b)));
        assert_eq!(transport.reader_count("dev/control"), 1);

        transport.publish("dev/control", Bytes::from_static(b"cmd")).unwrap();
        assert_eq!(got.lock().len(), 1);

        drop(sub);
        assert_eq!(transport.publish("dev/control", Bytes::from_static(b"cmd")).unwrap(), 0);
    }
}
