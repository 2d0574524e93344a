//! Device presence on the well-known device-info topic.
//!
//! [`PresenceBroadcaster::announce`] publishes the device's
//! [`DeviceInfoMessage`] once, synchronously, before it returns. After that:
//!
//! | Event                          | Reaction                                   |
//! |--------------------------------|--------------------------------------------|
//! | reader joins `device-info`     | re-announce on the broadcaster task        |
//! | first reader handled           | fire the ack callback (at most once)       |
//! | ack timeout elapses            | fire the ack callback if it has not fired  |
//! | [`broadcast_disconnect`]       | publish `disconnected`, wait for a reader  |
//!
//! [`broadcast_disconnect`]: PresenceBroadcaster::broadcast_disconnect

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use devcast_types::{DEVICE_INFO_TOPIC, DeviceIdentity, DeviceInfoMessage, DevcastError, PresenceState};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{MatchEvent, Subscription, Transport};

/// How long to wait for a first reader before firing the ack callback anyway.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

pub type AckCallback = Box<dyn FnOnce() + Send>;

/// Where a broadcaster is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    Unannounced,
    Announced,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for BroadcastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BroadcastState::Unannounced => "unannounced",
            BroadcastState::Announced => "announced",
            BroadcastState::Disconnecting => "disconnecting",
            BroadcastState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

pub struct BroadcasterOptions {
    pub ack_timeout: Duration,
    /// Invoked once: after the first reader is handled, or after `ack_timeout`.
    pub on_first_ack: Option<AckCallback>,
}

impl Default for BroadcasterOptions {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            on_first_ack: None,
        }
    }
}

impl BroadcasterOptions {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_ack_callback(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_first_ack = Some(Box::new(callback));
        self
    }
}

struct Announcer {
    transport: Arc<dyn Transport>,
    identity: DeviceIdentity,
    state: Mutex<BroadcastState>,
    ack: Mutex<Option<AckCallback>>,
}

impl Announcer {
    fn publish(&self, presence: PresenceState) -> Result<usize, DevcastError> {
        let message = DeviceInfoMessage::from_identity(&self.identity, presence);
        self.transport
            .publish(DEVICE_INFO_TOPIC, Bytes::from(message.to_bytes()?))
    }

    fn fire_ack(&self, reason: &'static str) {
        let callback = self.ack.lock().take();
        if let Some(callback) = callback {
            debug!(serial = %self.identity.serial(), reason, "presence ack");
            callback();
        }
    }
}

/// Announces one device and keeps it discoverable until disconnected.
pub struct PresenceBroadcaster {
    announcer: Arc<Announcer>,
    matched: watch::Receiver<usize>,
    subscription: Mutex<Option<Subscription>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PresenceBroadcaster {
    /// Publish the announcement and start watching for readers.
    ///
    /// # Errors
    ///
    /// * [`DevcastError::InvalidState`] – no Tokio runtime is available.
    /// * The transport error if the initial announcement cannot be published.
    pub fn announce(
        transport: Arc<dyn Transport>,
        identity: DeviceIdentity,
        options: BroadcasterOptions,
    ) -> Result<Self, DevcastError> {
        let runtime = Handle::try_current().map_err(|_| {
            DevcastError::InvalidState("presence broadcaster needs a Tokio runtime".to_string())
        })?;

        let announcer = Arc::new(Announcer {
            transport,
            identity,
            state: Mutex::new(BroadcastState::Unannounced),
            ack: Mutex::new(options.on_first_ack),
        });

        let readers = announcer.publish(PresenceState::Connected)?;
        *announcer.state.lock() = BroadcastState::Announced;
        info!(
            serial = %announcer.identity.serial(),
            topic_root = %announcer.identity.topic_root(),
            readers,
            "device announced"
        );

        let (matched_tx, matched_rx) = watch::channel(0usize);
        let (joined_tx, joined_rx) = mpsc::unbounded_channel::<String>();
        let subscription = announcer.transport.on_subscriber_matched(
            DEVICE_INFO_TOPIC,
            Box::new(move |event: &MatchEvent| {
                matched_tx.send_replace(event.current_count);
                if event.change > 0 {
                    let _ = joined_tx.send(event.reader.clone());
                }
            }),
        );

        let mut tasks = vec![runtime.spawn(reannounce(Arc::clone(&announcer), joined_rx))];
        if announcer.ack.lock().is_some() {
            let timeout = options.ack_timeout;
            let waiting = Arc::clone(&announcer);
            tasks.push(runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if waiting.ack.lock().is_some() {
                    warn!(serial = %waiting.identity.serial(), ?timeout, "no reader acknowledged the announcement");
                }
                waiting.fire_ack("timeout");
            }));
        }

        Ok(Self {
            announcer,
            matched: matched_rx,
            subscription: Mutex::new(Some(subscription)),
            tasks,
        })
    }

    /// Publish a `disconnected` message and wait up to `timeout` for a reader
    /// to be matched. Returns whether one was.
    ///
    /// Re-announcement stops as soon as this is called. Calling it again once
    /// disconnected returns `false` without publishing.
    pub async fn broadcast_disconnect(&self, timeout: Duration) -> bool {
        {
            let mut state = self.announcer.state.lock();
            let current = *state;
            if current != BroadcastState::Announced {
                debug!(state = %current, "disconnect ignored");
                return false;
            }
            *state = BroadcastState::Disconnecting;
        }

        if let Err(e) = self.announcer.publish(PresenceState::Disconnected) {
            warn!(serial = %self.announcer.identity.serial(), error = %e, "disconnect publish failed");
        }

        let mut matched = self.matched.clone();
        let acked = tokio::time::timeout(timeout, matched.wait_for(|count| *count > 0))
            .await
            .is_ok_and(|seen| seen.is_ok());

        *self.announcer.state.lock() = BroadcastState::Disconnected;
        drop(self.subscription.lock().take());
        info!(serial = %self.announcer.identity.serial(), acked, "device disconnected");
        acked
    }

    pub fn state(&self) -> BroadcastState {
        *self.announcer.state.lock()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.announcer.identity
    }

    /// Readers currently matched on the device-info topic.
    pub fn subscriber_count(&self) -> usize {
        *self.matched.borrow()
    }
}

impl Drop for PresenceBroadcaster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn reannounce(announcer: Arc<Announcer>, mut joined: mpsc::UnboundedReceiver<String>) {
    while let Some(reader) = joined.recv().await {
        if *announcer.state.lock() != BroadcastState::Announced {
            continue;
        }
        match announcer.publish(PresenceState::Connected) {
            Ok(readers) => debug!(%reader, readers, "device re-announced"),
            Err(e) => warn!(%reader, error = %e, "re-announce failed"),
        }
        announcer.fire_ack("reader matched");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("Acme Vision D435", "123456", "D400", false)
    }

    async fn next_info(reader: &mut crate::transport::TopicReceiver) -> DeviceInfoMessage {
        let raw = tokio::time::timeout(Duration::from_secs(1), reader.recv())
            .await
            .expect("device info within a second")
            .expect("transport open");
        DeviceInfoMessage::from_bytes(&raw).expect("valid device info")
    }

    #[tokio::test]
    async fn announcement_is_published_before_returning() -> Result<(), Box<dyn std::error::Error>> {
        let transport = LocalTransport::new();
        let mut watcher = transport.subscribe(DEVICE_INFO_TOPIC);

        let broadcaster =
            PresenceBroadcaster::announce(Arc::new(transport.clone()), identity(), BroadcasterOptions::default())?;
        assert_eq!(broadcaster.state(), BroadcastState::Announced);

        let raw = watcher.try_recv().ok_or("announcement not published synchronously")?;
        let info = DeviceInfoMessage::from_bytes(&raw)?;
        assert_eq!(info.serial_number, "123456");
        assert_eq!(info.state, PresenceState::Connected);
        Ok(())
    }

    #[tokio::test]
    async fn late_watcher_receives_announcement() -> Result<(), Box<dyn std::error::Error>> {
        let transport = LocalTransport::new();
        let _broadcaster =
            PresenceBroadcaster::announce(Arc::new(transport.clone()), identity(), BroadcasterOptions::default())?;

        let mut watcher = transport.subscribe(DEVICE_INFO_TOPIC);
        let info = next_info(&mut watcher).await;
        assert_eq!(info.topic_root, identity().topic_root());
        Ok(())
    }

    #[tokio::test]
    async fn ack_fires_once_for_many_readers() -> Result<(), Box<dyn std::error::Error>> {
        let transport = LocalTransport::new();
        let acks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&acks);
        let options = BroadcasterOptions::default()
            .with_ack_timeout(Duration::from_millis(50))
            .with_ack_callback(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let _broadcaster = PresenceBroadcaster::announce(Arc::new(transport.clone()), identity(), options)?;

        let mut a = transport.subscribe(DEVICE_INFO_TOPIC);
        let mut b = transport.subscribe(DEVICE_INFO_TOPIC);
        next_info(&mut a).await;
        next_info(&mut b).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(acks.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn ack_fires_on_timeout_without_readers() -> Result<(), Box<dyn std::error::Error>> {
        let transport = LocalTransport::new();
        let acks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&acks);
        let options = BroadcasterOptions::default()
            .with_ack_timeout(Duration::from_millis(20))
            .with_ack_callback(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let _broadcaster = PresenceBroadcaster::announce(Arc::new(transport), identity(), options)?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_without_readers_times_out() -> Result<(), Box<dyn std::error::Error>> {
        let transport = LocalTransport::new();
        let broadcaster =
            PresenceBroadcaster::announce(Arc::new(transport), identity(), BroadcasterOptions::default())?;

        assert!(!broadcaster.broadcast_disconnect(Duration::from_millis(30)).await);
        assert_eq!(broadcaster.state(), BroadcastState::Disconnected);
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_reaches_watcher() -> Result<(), Box<dyn std::error::Error>> {
        let transport = LocalTransport::new();
        let mut watcher = transport.subscribe(DEVICE_INFO_TOPIC);
        let broadcaster =
            PresenceBroadcaster::announce(Arc::new(transport.clone()), identity(), BroadcasterOptions::default())?;
        assert_eq!(next_info(&mut watcher).await.state, PresenceState::Connected);

        assert!(broadcaster.broadcast_disconnect(Duration::from_millis(200)).await);

        let mut last = next_info(&mut watcher).await;
        while last.state == PresenceState::Connected {
            last = next_info(&mut watcher).await;
        }
        assert_eq!(last.state, PresenceState::Disconnected);

        // A second call is a no-op.
        assert!(!broadcaster.broadcast_disconnect(Duration::from_millis(10)).await);
        Ok(())
    }

    #[tokio::test]
    async fn no_reannounce_after_disconnect() -> Result<(), Box<dyn std::error::Error>> {
        let transport = LocalTransport::new();
        let broadcaster =
            PresenceBroadcaster::announce(Arc::new(transport.clone()), identity(), BroadcasterOptions::default())?;
        broadcaster.broadcast_disconnect(Duration::from_millis(10)).await;

        let mut watcher = transport.subscribe(DEVICE_INFO_TOPIC);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(watcher.try_recv().is_none());
        Ok(())
    }

    #[test]
    fn announce_needs_a_runtime() {
        let transport = LocalTransport::new();
        let result =
            PresenceBroadcaster::announce(Arc::new(transport), identity(), BroadcasterOptions::default());
        assert!(matches!(result, Err(DevcastError::InvalidState(_))));
    }
}
