//! [`DeviceServer`] – exposes one device on a [`Transport`].
//!
//! Construction announces the device and starts listening for control
//! messages. [`DeviceServer::init`] then creates the stream publishers and the
//! notification channel; only after that is the server valid.
//!
//! ```text
//!   <root>/control        ──► ControlChannel ──► on_open/close_streams handler
//!   <root>/notification   ◄── NotificationChannel
//!   <root>/<stream-name>  ◄── StreamPublisher (one per stream)
//!   devcast/device-info   ◄── PresenceBroadcaster
//! ```
//!
//! Control handlers receive a [`DeviceServer`] handle built from a weak
//! reference, so registering one never keeps the server alive.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use devcast_middleware::{
    AckCallback, BroadcastState, BroadcasterOptions, ControlChannel, DEFAULT_ACK_TIMEOUT,
    DEFAULT_NOTIFICATION_QUEUE_CAPACITY, NotificationChannel, PresenceBroadcaster, Transport,
};
use devcast_sync::{DEFAULT_MAX_METADATA_QUEUE_SIZE, DEFAULT_MAX_SAMPLE_QUEUE_SIZE};
use devcast_types::{
    CONTROL_TOPIC, CloseStreams, DeliveryPolicy, DevcastError, DeviceIdentity, ImageHeader,
    MetadataMap, NOTIFICATION_TOPIC, Notification, OpenStreams, StreamDescriptor, StreamProfile,
};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::stream::StreamPublisher;

// ────────────────────────────────────────────────────────────────────────────
// Options and requests
// ────────────────────────────────────────────────────────────────────────────

/// Tunables for a [`DeviceServer`].
pub struct ServerOptions {
    pub max_sample_queue_size: usize,
    pub max_metadata_queue_size: usize,
    pub notification_capacity: usize,
    pub ack_timeout: Duration,
    pub on_first_ack: Option<AckCallback>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_sample_queue_size: DEFAULT_MAX_SAMPLE_QUEUE_SIZE,
            max_metadata_queue_size: DEFAULT_MAX_METADATA_QUEUE_SIZE,
            notification_capacity: DEFAULT_NOTIFICATION_QUEUE_CAPACITY,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            on_first_ack: None,
        }
    }
}

impl ServerOptions {
    pub fn with_queue_sizes(mut self, samples: usize, metadata: usize) -> Self {
        self.max_sample_queue_size = samples;
        self.max_metadata_queue_size = metadata;
        self
    }

    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_ack_callback(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_first_ack = Some(Box::new(callback));
        self
    }
}

/// An open-streams command with each profile resolved to a stream name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenStreamsRequest {
    pub message_id: u32,
    pub sensor_id: i16,
    pub streams: Vec<(String, StreamProfile)>,
}

/// A close-streams command with the sensor's streams resolved by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStreamsRequest {
    pub message_id: u32,
    pub sensor_id: i16,
    pub stream_names: Vec<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Server
// ────────────────────────────────────────────────────────────────────────────

struct ServerInner {
    transport: Arc<dyn Transport>,
    identity: DeviceIdentity,
    max_sample_queue_size: usize,
    max_metadata_queue_size: usize,
    notification_capacity: usize,
    broadcaster: PresenceBroadcaster,
    control: ControlChannel,
    notifications: Mutex<Option<Arc<NotificationChannel>>>,
    streams: RwLock<Vec<Arc<StreamPublisher>>>,
    initialised: Mutex<bool>,
}

/// Cheap to clone; all clones drive the same device.
#[derive(Clone)]
pub struct DeviceServer {
    inner: Arc<ServerInner>,
}

impl DeviceServer {
    /// Announce `identity` and start the control channel.
    ///
    /// # Errors
    ///
    /// [`DevcastError::InvalidState`] outside a Tokio runtime, or the
    /// transport error if the announcement cannot be published.
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: DeviceIdentity,
        options: ServerOptions,
    ) -> Result<Self, DevcastError> {
        let broadcaster = PresenceBroadcaster::announce(
            Arc::clone(&transport),
            identity.clone(),
            BroadcasterOptions {
                ack_timeout: options.ack_timeout,
                on_first_ack: options.on_first_ack,
            },
        )?;
        let control = ControlChannel::new(Arc::clone(&transport), identity.topic(CONTROL_TOPIC));
        control.start()?;

        info!(
            name = %identity.name(),
            serial = %identity.serial(),
            topic_root = %identity.topic_root(),
            "device server created"
        );

        Ok(Self {
            inner: Arc::new(ServerInner {
                transport,
                identity,
                max_sample_queue_size: options.max_sample_queue_size,
                max_metadata_queue_size: options.max_metadata_queue_size,
                notification_capacity: options.notification_capacity,
                broadcaster,
                control,
                notifications: Mutex::new(None),
                streams: RwLock::new(Vec::new()),
                initialised: Mutex::new(false),
            }),
        })
    }

    /// Create the stream publishers and the notification channel.
    ///
    /// Stream names must be unique, non-empty and distinct from the reserved
    /// `notification` and `control` topics. On error nothing is created.
    #[instrument(skip_all, fields(serial = %self.inner.identity.serial(), streams = streams.len()))]
    pub fn init(&self, streams: Vec<StreamDescriptor>) -> Result<(), DevcastError> {
        let mut initialised = self.inner.initialised.lock();
        if *initialised {
            return Err(DevcastError::InvalidState(
                "device server already initialised".to_string(),
            ));
        }
        validate_stream_names(&streams)?;

        let publishers: Vec<Arc<StreamPublisher>> = streams
            .iter()
            .map(|descriptor| {
                Arc::new(StreamPublisher::new(
                    Arc::clone(&self.inner.transport),
                    descriptor,
                    self.inner.identity.topic(&descriptor.name),
                    self.inner.max_sample_queue_size,
                    self.inner.max_metadata_queue_size,
                ))
            })
            .collect();

        let channel = NotificationChannel::new(
            Arc::clone(&self.inner.transport),
            self.inner.identity.topic(NOTIFICATION_TOPIC),
            self.inner.notification_capacity,
        );
        channel.add_discovery_notification(json_bytes(&json!({
            "id": "device-header",
            "name": self.inner.identity.name(),
            "serial-number": self.inner.identity.serial(),
            "product-line": self.inner.identity.product_line(),
            "n-streams": streams.len(),
        }))?);
        for descriptor in &streams {
            channel.add_discovery_notification(json_bytes(&json!({
                "id": "stream-header",
                "name": descriptor.name,
                "type": descriptor.stream_type,
                "sensor-id": descriptor.sensor_id,
                "topic": self.inner.identity.topic(&descriptor.name),
            }))?);
        }
        channel.start()?;

        *self.inner.streams.write() = publishers;
        *self.inner.notifications.lock() = Some(Arc::new(channel));
        *initialised = true;
        info!("device server initialised");
        Ok(())
    }

    /// `true` between a successful [`init`](Self::init) and [`shutdown`](Self::shutdown).
    pub fn is_valid(&self) -> bool {
        self.inner.notifications.lock().is_some()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn streams(&self) -> Vec<StreamDescriptor> {
        self.inner
            .streams
            .read()
            .iter()
            .map(|stream| stream.descriptor())
            .collect()
    }

    pub fn broadcaster_state(&self) -> BroadcastState {
        self.inner.broadcaster.state()
    }

    /// Readers currently matched on the notification topic.
    pub fn notification_subscribers(&self) -> usize {
        self.inner
            .notifications
            .lock()
            .as_ref()
            .map_or(0, |channel| channel.subscriber_count())
    }

    // ── Streaming ──────────────────────────────────────────────────────────

    pub fn start_streaming(&self, stream_name: &str, header: ImageHeader) -> Result<(), DevcastError> {
        let stream = self.stream(stream_name)?;
        stream.start_streaming(header)?;
        self.notify_state_change(json!({
            "id": "stream-started",
            "name": stream_name,
            "format": header.format,
            "width": header.width,
            "height": header.height,
            "timestamp": Utc::now().to_rfc3339(),
        }));
        Ok(())
    }

    pub fn stop_streaming(&self, stream_name: &str) -> Result<(), DevcastError> {
        let stream = self.stream(stream_name)?;
        stream.stop_streaming();
        self.notify_state_change(json!({
            "id": "stream-stopped",
            "name": stream_name,
            "timestamp": Utc::now().to_rfc3339(),
        }));
        Ok(())
    }

    pub fn publish_image(
        &self,
        stream_name: &str,
        key: u64,
        payload: impl Into<Bytes>,
    ) -> Result<(), DevcastError> {
        self.stream(stream_name)?.publish_image(key, payload.into())
    }

    pub fn publish_metadata(
        &self,
        stream_name: &str,
        key: u64,
        metadata: MetadataMap,
    ) -> Result<(), DevcastError> {
        self.stream(stream_name)?.publish_metadata(key, metadata)
    }

    /// Route `notification` by its delivery policy.
    pub fn publish_notification(&self, notification: Notification) -> Result<(), DevcastError> {
        let channel = self.notification_channel()?;
        match notification.policy {
            DeliveryPolicy::OnDemand => channel.send_notification(notification.payload),
            DeliveryPolicy::OnDiscovery => {
                channel.add_discovery_notification(notification.payload);
                Ok(())
            }
        }
    }

    // ── Control ────────────────────────────────────────────────────────────

    /// Handle remote open-streams commands.
    ///
    /// Each requested profile is resolved to the stream of the addressed
    /// sensor with the same stream type; a profile with no such stream
    /// rejects the whole command before `handler` runs.
    pub fn on_open_streams<F>(&self, handler: F)
    where
        F: Fn(&DeviceServer, &OpenStreamsRequest) -> Result<(), DevcastError> + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        self.inner.control.on_open_streams(move |message_id, open| {
            let server = upgrade(&weak)?;
            let request = server.resolve_open(message_id, open)?;
            handler(&server, &request)
        });
    }

    /// Handle remote close-streams commands for every stream of the sensor.
    pub fn on_close_streams<F>(&self, handler: F)
    where
        F: Fn(&DeviceServer, &CloseStreamsRequest) -> Result<(), DevcastError> + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        self.inner.control.on_close_streams(move |message_id, close| {
            let server = upgrade(&weak)?;
            let request = server.resolve_close(message_id, close)?;
            handler(&server, &request)
        });
    }

    // ── Teardown ───────────────────────────────────────────────────────────

    /// Tell watchers the device is leaving. See
    /// [`PresenceBroadcaster::broadcast_disconnect`].
    pub async fn broadcast_disconnect(&self, timeout: Duration) -> bool {
        self.inner.broadcaster.broadcast_disconnect(timeout).await
    }

    /// Stop the control channel, then the notification channel, then every
    /// stream. The server is invalid afterwards.
    pub fn shutdown(&self) {
        self.inner.control.stop();
        if let Some(channel) = self.inner.notifications.lock().take() {
            channel.stop();
        }
        for stream in self.inner.streams.read().iter() {
            stream.stop_streaming();
        }
        info!(serial = %self.inner.identity.serial(), "device server shut down");
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn notification_channel(&self) -> Result<Arc<NotificationChannel>, DevcastError> {
        self.inner.notifications.lock().clone().ok_or_else(|| {
            DevcastError::InvalidState("device server is not initialised".to_string())
        })
    }

    fn stream(&self, name: &str) -> Result<Arc<StreamPublisher>, DevcastError> {
        if !self.is_valid() {
            return Err(DevcastError::InvalidState(
                "device server is not initialised".to_string(),
            ));
        }
        self.inner
            .streams
            .read()
            .iter()
            .find(|stream| stream.name() == name)
            .cloned()
            .ok_or_else(|| DevcastError::UnknownStream(name.to_string()))
    }

    fn notify_state_change(&self, body: serde_json::Value) {
        let sent = self
            .notification_channel()
            .and_then(|channel| channel.send_notification(json_bytes(&body)?));
        if let Err(e) = sent {
            warn!(error = %e, "stream state notification not sent");
        }
    }

    fn resolve_open(&self, message_id: u32, open: &OpenStreams) -> Result<OpenStreamsRequest, DevcastError> {
        let streams = self.inner.streams.read();
        let resolved = open
            .profiles()
            .iter()
            .map(|profile| {
                streams
                    .iter()
                    .find(|s| s.sensor_id() == open.sensor_id() && s.stream_type() == profile.stream_type)
                    .map(|s| (s.name().to_string(), *profile))
                    .ok_or_else(|| {
                        DevcastError::UnknownStream(format!(
                            "sensor {} has no {:?} stream",
                            open.sensor_id(),
                            profile.stream_type
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(OpenStreamsRequest {
            message_id,
            sensor_id: open.sensor_id(),
            streams: resolved,
        })
    }

    fn resolve_close(&self, message_id: u32, close: &CloseStreams) -> Result<CloseStreamsRequest, DevcastError> {
        let stream_names: Vec<String> = self
            .inner
            .streams
            .read()
            .iter()
            .filter(|s| s.sensor_id() == close.sensor_id)
            .map(|s| s.name().to_string())
            .collect();
        if stream_names.is_empty() {
            return Err(DevcastError::UnknownStream(format!(
                "sensor {} has no streams",
                close.sensor_id
            )));
        }
        Ok(CloseStreamsRequest {
            message_id,
            sensor_id: close.sensor_id,
            stream_names,
        })
    }
}

fn upgrade(weak: &Weak<ServerInner>) -> Result<DeviceServer, DevcastError> {
    weak.upgrade()
        .map(|inner| DeviceServer { inner })
        .ok_or_else(|| DevcastError::InvalidState("device server is gone".to_string()))
}

fn validate_stream_names(streams: &[StreamDescriptor]) -> Result<(), DevcastError> {
    let mut seen = std::collections::HashSet::new();
    for descriptor in streams {
        let name = descriptor.name.as_str();
        if name.is_empty() || name.contains('/') {
            return Err(DevcastError::InvalidState(format!("invalid stream name '{name}'")));
        }
        if name == NOTIFICATION_TOPIC || name == CONTROL_TOPIC {
            return Err(DevcastError::InvalidState(format!("stream name '{name}' is reserved")));
        }
        if !seen.insert(name) {
            return Err(DevcastError::InvalidState(format!("duplicate stream name '{name}'")));
        }
    }
    Ok(())
}

fn json_bytes(value: &serde_json::Value) -> Result<Bytes, DevcastError> {
    Notification::json(DeliveryPolicy::OnDemand, value).map(|n| n.payload)
}
