//! [`NotificationChannel`] – device → client notifications.
//!
//! Two delivery policies share one publishing task:
//!
//! * **On demand** – [`NotificationChannel::send_notification`] queues the
//!   payload on a bounded channel and returns immediately. The delivery task
//!   publishes queued payloads in FIFO order.
//! * **On discovery** – [`NotificationChannel::add_discovery_notification`]
//!   retains the payload. Each time a new reader matches the notification
//!   topic, every retained payload is published again, in the order added,
//!   so the newcomer catches up on the device state.
//!
//! The transport's match callback only forwards a wake-up to the delivery
//! task; it never publishes on the transport thread.
//!
//! Stopping the channel wakes the task at once. On-demand payloads still
//! queued at that point are discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use devcast_types::DevcastError;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::lifecycle::Lifecycle;
use crate::transport::{MatchEvent, Subscription, Transport};

/// Default number of on-demand notifications waiting for the delivery task.
pub const DEFAULT_NOTIFICATION_QUEUE_CAPACITY: usize = 64;

/// State shared between the channel handle and its delivery task.
struct Delivery {
    transport: Arc<dyn Transport>,
    topic: String,
    retained: Mutex<Vec<Bytes>>,
    matched: Mutex<usize>,
    failures: AtomicU64,
}

impl Delivery {
    fn publish(&self, payload: Bytes) {
        match self.transport.publish(&self.topic, payload) {
            Ok(readers) => debug!(topic = %self.topic, readers, "notification published"),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %self.topic, error = %e, "notification publish failed");
            }
        }
    }

    fn replay(&self) {
        let retained = self.retained.lock().clone();
        debug!(topic = %self.topic, count = retained.len(), "replaying discovery notifications");
        for payload in retained {
            self.publish(payload);
        }
    }
}

struct Running {
    queue: mpsc::Sender<Bytes>,
    shutdown: oneshot::Sender<()>,
    _matched: Subscription,
}

struct ChannelState {
    lifecycle: Lifecycle,
    running: Option<Running>,
}

/// Publishes notifications on one topic. See the [module docs](self).
pub struct NotificationChannel {
    delivery: Arc<Delivery>,
    capacity: usize,
    state: Mutex<ChannelState>,
}

impl NotificationChannel {
    /// Create an idle channel publishing on `topic`.
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>, capacity: usize) -> Self {
        Self {
            delivery: Arc::new(Delivery {
                transport,
                topic: topic.into(),
                retained: Mutex::new(Vec::new()),
                matched: Mutex::new(0),
                failures: AtomicU64::new(0),
            }),
            capacity: capacity.max(1),
            state: Mutex::new(ChannelState {
                lifecycle: Lifecycle::Idle,
                running: None,
            }),
        }
    }

    /// Spawn the delivery task and start listening for new readers.
    ///
    /// # Errors
    ///
    /// [`DevcastError::InvalidState`] when the channel is not idle or when no
    /// Tokio runtime is available.
    pub fn start(&self) -> Result<(), DevcastError> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Idle {
            return Err(DevcastError::InvalidState(format!(
                "notification channel is {}",
                state.lifecycle
            )));
        }
        let runtime = Handle::try_current().map_err(|_| {
            DevcastError::InvalidState("notification channel needs a Tokio runtime".to_string())
        })?;

        let (queue_tx, queue_rx) = mpsc::channel(self.capacity);
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        runtime.spawn(run_delivery(
            Arc::clone(&self.delivery),
            queue_rx,
            discovery_rx,
            shutdown_rx,
        ));

        let weak: Weak<Delivery> = Arc::downgrade(&self.delivery);
        let matched = self.delivery.transport.on_subscriber_matched(
            &self.delivery.topic,
            Box::new(move |event: &MatchEvent| {
                if let Some(delivery) = weak.upgrade() {
                    *delivery.matched.lock() = event.current_count;
                }
                if event.change > 0 {
                    debug!(topic = %event.topic, reader = %event.reader, "notification reader discovered");
                    let _ = discovery_tx.send(());
                }
            }),
        );

        state.running = Some(Running {
            queue: queue_tx,
            shutdown: shutdown_tx,
            _matched: matched,
        });
        state.lifecycle = Lifecycle::Running;
        info!(topic = %self.delivery.topic, "notification channel started");
        Ok(())
    }

    /// Queue `payload` for on-demand delivery. Never waits on the network.
    ///
    /// # Errors
    ///
    /// * [`DevcastError::InvalidState`] – the channel is not running.
    /// * [`DevcastError::QueueFull`] – the delivery task is behind.
    pub fn send_notification(&self, payload: Bytes) -> Result<(), DevcastError> {
        let state = self.state.lock();
        let running = match (&state.lifecycle, &state.running) {
            (Lifecycle::Running, Some(running)) => running,
            (lifecycle, _) => {
                return Err(DevcastError::InvalidState(format!(
                    "notification channel is {lifecycle}"
                )));
            }
        };
        running.queue.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DevcastError::QueueFull(format!(
                "{} notifications pending on '{}'",
                self.capacity, self.delivery.topic
            )),
            mpsc::error::TrySendError::Closed(_) => {
                DevcastError::ChannelClosed(self.delivery.topic.clone())
            }
        })
    }

    /// Retain `payload` and replay it to every reader that matches from now on.
    pub fn add_discovery_notification(&self, payload: Bytes) {
        self.delivery.retained.lock().push(payload);
    }

    /// Stop the delivery task. Queued on-demand notifications are discarded.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(running) = state.running.take() {
            let _ = running.shutdown.send(());
            info!(topic = %self.delivery.topic, "notification channel stopped");
        }
        state.lifecycle = Lifecycle::Stopped;
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn topic(&self) -> &str {
        &self.delivery.topic
    }

    /// Readers currently matched on the notification topic.
    pub fn subscriber_count(&self) -> usize {
        *self.delivery.matched.lock()
    }

    /// Publishes that failed since the channel was created.
    pub fn delivery_failures(&self) -> u64 {
        self.delivery.failures.load(Ordering::Relaxed)
    }

    pub fn discovery_notification_count(&self) -> usize {
        self.delivery.retained.lock().len()
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_delivery(
    delivery: Arc<Delivery>,
    mut queue: mpsc::Receiver<Bytes>,
    mut discoveries: mpsc::UnboundedReceiver<()>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            Some(()) = discoveries.recv() => delivery.replay(),
            next = queue.recv() => match next {
                Some(payload) => delivery.publish(payload),
                None => break,
            },
        }
    }

    queue.close();
    let mut discarded = 0usize;
    while queue.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!(topic = %delivery.topic, discarded, "pending notifications discarded on stop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTransport;
    use std::time::Duration;

    const TOPIC: &str = "devcast/D435/1/notification";

    fn channel(capacity: usize) -> (LocalTransport, NotificationChannel) {
        let transport = LocalTransport::new();
        let channel = NotificationChannel::new(Arc::new(transport.clone()), TOPIC, capacity);
        (transport, channel)
    }

    async fn next(reader: &mut crate::transport::TopicReceiver) -> Bytes {
        tokio::time::timeout(Duration::from_secs(1), reader.recv())
            .await
            .expect("notification within a second")
            .expect("transport still open")
    }

    #[tokio::test]
    async fn on_demand_notifications_arrive_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let (transport, channel) = channel(8);
        let mut reader = transport.subscribe(TOPIC);
        channel.start()?;

        for text in ["one", "two", "three"] {
            channel.send_notification(Bytes::from(text))?;
        }
        assert_eq!(next(&mut reader).await, "one");
        assert_eq!(next(&mut reader).await, "two");
        assert_eq!(next(&mut reader).await, "three");
        Ok(())
    }

    #[tokio::test]
    async fn discovery_notifications_replay_to_each_new_reader() -> Result<(), Box<dyn std::error::Error>> {
        let (transport, channel) = channel(8);
        channel.add_discovery_notification(Bytes::from_static(b"A"));
        channel.add_discovery_notification(Bytes::from_static(b"B"));
        channel.start()?;

        let mut first = transport.subscribe(TOPIC);
        assert_eq!(next(&mut first).await, "A");
        assert_eq!(next(&mut first).await, "B");

        let mut second = transport.subscribe(TOPIC);
        assert_eq!(next(&mut second).await, "A");
        assert_eq!(next(&mut second).await, "B");
        assert_eq!(channel.subscriber_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn send_before_start_is_rejected() {
        let (_transport, channel) = channel(8);
        assert!(matches!(
            channel.send_notification(Bytes::from_static(b"x")),
            Err(DevcastError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn full_queue_is_reported_without_blocking() -> Result<(), Box<dyn std::error::Error>> {
        // The test runtime is single-threaded, so the delivery task cannot
        // drain anything until this test yields.
        let (_transport, channel) = channel(2);
        channel.start()?;
        channel.send_notification(Bytes::from_static(b"1"))?;
        channel.send_notification(Bytes::from_static(b"2"))?;
        assert!(matches!(
            channel.send_notification(Bytes::from_static(b"3")),
            Err(DevcastError::QueueFull(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn publish_failure_does_not_stop_delivery() -> Result<(), Box<dyn std::error::Error>> {
        let (transport, channel) = channel(8);
        let mut reader = transport.subscribe(TOPIC);
        channel.start()?;

        transport.set_offline(true);
        channel.send_notification(Bytes::from_static(b"lost"))?;
        while channel.delivery_failures() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.set_offline(false);

        channel.send_notification(Bytes::from_static(b"kept"))?;
        assert_eq!(next(&mut reader).await, "kept");
        Ok(())
    }

    #[tokio::test]
    async fn stop_rejects_further_sends() -> Result<(), Box<dyn std::error::Error>> {
        let (transport, channel) = channel(8);
        channel.start()?;
        assert_eq!(channel.lifecycle(), Lifecycle::Running);

        channel.send_notification(Bytes::from_static(b"pending"))?;
        channel.stop();
        assert_eq!(channel.lifecycle(), Lifecycle::Stopped);
        assert!(channel.send_notification(Bytes::from_static(b"late")).is_err());
        assert!(channel.start().is_err());

        // The match registration went away with the running state.
        let _reader = transport.subscribe(TOPIC);
        assert_eq!(channel.subscriber_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stop_discards_queued_notifications_and_ends_the_task() -> Result<(), Box<dyn std::error::Error>> {
        let (transport, channel) = channel(8);
        let mut reader = transport.subscribe(TOPIC);
        channel.start()?;

        // Nothing is delivered before this test yields.
        for n in 0..5u8 {
            channel.send_notification(Bytes::from(vec![n]))?;
        }
        channel.stop();

        // The delivery task holds the only other reference to the shared state.
        tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(&channel.delivery) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await?;
        assert!(reader.try_recv().is_none());
        assert_eq!(channel.delivery_failures(), 0);
        Ok(())
    }

    #[test]
    fn start_without_runtime_fails() {
        let (_transport, channel) = channel(8);
        assert!(matches!(channel.start(), Err(DevcastError::InvalidState(_))));
        assert_eq!(channel.lifecycle(), Lifecycle::Idle);
    }
}
