//! [`StreamPublisher`] – one named stream of a device.
//!
//! Images and metadata are fed in independently. A [`MetadataSyncer`] pairs
//! them by key and every pair is published on `<root>/<stream-name>` as a
//! [`StreamFrame`]. Nothing is accepted while the stream is stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use devcast_middleware::Transport;
use devcast_sync::{MatchedPair, MetadataSyncer};
use devcast_types::{
    DevcastError, ImageHeader, MetadataMap, StreamDescriptor, StreamFrame, StreamType,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub struct StreamPublisher {
    name: String,
    stream_type: StreamType,
    sensor_id: i16,
    topic: String,
    header: Arc<Mutex<Option<ImageHeader>>>,
    syncer: MetadataSyncer<Bytes, MetadataMap>,
    published: Arc<AtomicU64>,
}

impl StreamPublisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        descriptor: &StreamDescriptor,
        topic: impl Into<String>,
        max_sample_queue_size: usize,
        max_metadata_queue_size: usize,
    ) -> Self {
        let topic = topic.into();
        let header = Arc::new(Mutex::new(None::<ImageHeader>));
        let published = Arc::new(AtomicU64::new(0));

        let pair_header = Arc::clone(&header);
        let pair_count = Arc::clone(&published);
        let pair_topic = topic.clone();
        let dropped_stream = descriptor.name.clone();

        let syncer = MetadataSyncer::new(max_sample_queue_size, max_metadata_queue_size)
            .on_pair_ready(move |pair: MatchedPair<Bytes, MetadataMap>| {
                let Some(header) = *pair_header.lock() else {
                    debug!(topic = %pair_topic, key = pair.key, "stream stopped; pair discarded");
                    return Ok(());
                };
                let frame = StreamFrame {
                    key: pair.key,
                    header,
                    metadata: pair.metadata,
                    payload: pair.sample,
                };
                match frame.encode().and_then(|raw| transport.publish(&pair_topic, raw)) {
                    Ok(_) => {
                        pair_count.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(e) => {
                        warn!(topic = %pair_topic, key = frame.key, error = %e, "frame publish failed");
                        Err(e)
                    }
                }
            })
            .on_metadata_dropped(move |key, _| {
                debug!(stream = %dropped_stream, key, "metadata dropped without a matching image");
            });

        Self {
            name: descriptor.name.clone(),
            stream_type: descriptor.stream_type,
            sensor_id: descriptor.sensor_id,
            topic,
            header,
            syncer,
            published,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn sensor_id(&self) -> i16 {
        self.sensor_id
    }

    pub fn is_streaming(&self) -> bool {
        self.header.lock().is_some()
    }

    /// Frames successfully handed to the transport.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            name: self.name.clone(),
            stream_type: self.stream_type,
            sensor_id: self.sensor_id,
            header: *self.header.lock(),
        }
    }

    /// Begin streaming with `header`. Restarting resets the key history.
    ///
    /// # Errors
    ///
    /// [`DevcastError::InvalidHeader`] unless both dimensions are positive;
    /// the stream is left untouched.
    pub fn start_streaming(&self, header: ImageHeader) -> Result<(), DevcastError> {
        if !header.is_valid() {
            return Err(DevcastError::InvalidHeader {
                stream: self.name.clone(),
                width: header.width,
                height: header.height,
            });
        }
        self.syncer.clear();
        *self.header.lock() = Some(header);
        info!(
            stream = %self.name,
            format = ?header.format,
            width = header.width,
            height = header.height,
            "stream started"
        );
        Ok(())
    }

    /// Stop streaming. Anything still waiting for a match is discarded.
    pub fn stop_streaming(&self) {
        let was_streaming = self.header.lock().take().is_some();
        self.syncer.clear();
        if was_streaming {
            info!(stream = %self.name, "stream stopped");
        }
    }

    /// Feed one image.
    ///
    /// A publish error is returned by the call that was publishing when it
    /// happened. With concurrent feeders that may be the metadata side.
    pub fn publish_image(&self, key: u64, payload: Bytes) -> Result<(), DevcastError> {
        self.ensure_streaming()?;
        self.syncer.enqueue_sample(key, payload)
    }

    /// Feed the metadata for the image with the same `key`.
    pub fn publish_metadata(&self, key: u64, metadata: MetadataMap) -> Result<(), DevcastError> {
        self.ensure_streaming()?;
        self.syncer.enqueue_metadata(key, metadata)
    }

    /// Publish every image still waiting for metadata.
    pub fn flush(&self) -> Result<(), DevcastError> {
        self.syncer.flush()
    }

    fn ensure_streaming(&self) -> Result<(), DevcastError> {
        if self.is_streaming() {
            Ok(())
        } else {
            Err(DevcastError::InvalidState(format!(
                "stream '{}' is not streaming",
                self.name
            )))
        }
    }
}
