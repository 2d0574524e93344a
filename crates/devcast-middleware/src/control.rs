//! Client → device control commands.
//!
//! [`ControlChannel`] is the device side: it listens on `<root>/control`,
//! decodes each [`ControlMessage`] and dispatches it, in receipt order, to the
//! registered open/close handler. [`ControlClient`] is the matching sender.
//!
//! Transport callbacks only forward raw bytes to the dispatch task. Malformed
//! messages and handler failures are logged and skipped; one bad message
//! never stops the channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;
use devcast_types::{
    CloseStreams, ControlCommand, ControlMessage, DevcastError, OpenStreams, StreamProfile,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::lifecycle::Lifecycle;
use crate::transport::{Subscription, Transport};

pub type OpenStreamsHandler =
    Arc<dyn Fn(u32, &OpenStreams) -> Result<(), DevcastError> + Send + Sync>;
pub type CloseStreamsHandler =
    Arc<dyn Fn(u32, &CloseStreams) -> Result<(), DevcastError> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    open: Option<OpenStreamsHandler>,
    close: Option<CloseStreamsHandler>,
}

struct Dispatcher {
    topic: String,
    handlers: Mutex<Handlers>,
    dispatched: AtomicU64,
    rejected: AtomicU64,
}

impl Dispatcher {
    fn dispatch(&self, raw: &[u8]) {
        let message = match ControlMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %self.topic, len = raw.len(), error = %e, "dropping malformed control message");
                return;
            }
        };

        let id = message.message_id;
        let outcome = match &message.command {
            ControlCommand::OpenStreams(open) => {
                let handler = self.handlers.lock().open.clone();
                debug!(id, sensor_id = open.sensor_id(), profiles = open.profiles().len(), "open streams");
                handler.map(|h| h(id, open))
            }
            ControlCommand::CloseStreams(close) => {
                let handler = self.handlers.lock().close.clone();
                debug!(id, sensor_id = close.sensor_id, "close streams");
                handler.map(|h| h(id, close))
            }
        };

        match outcome {
            Some(Ok(())) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Some(Err(e)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %self.topic, id, error = %e, "control handler failed");
            }
            None => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %self.topic, id, "no handler registered for control command");
            }
        }
    }
}

struct Running {
    shutdown: oneshot::Sender<()>,
    _messages: Subscription,
}

struct ChannelState {
    lifecycle: Lifecycle,
    running: Option<Running>,
}

// ────────────────────────────────────────────────────────────────────────────
// Device side
// ────────────────────────────────────────────────────────────────────────────

/// Receives control messages for one device.
pub struct ControlChannel {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<ChannelState>,
}

impl ControlChannel {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            dispatcher: Arc::new(Dispatcher {
                topic: topic.into(),
                handlers: Mutex::new(Handlers::default()),
                dispatched: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
            state: Mutex::new(ChannelState {
                lifecycle: Lifecycle::Idle,
                running: None,
            }),
        }
    }

    /// Replace the open-streams handler. Takes effect for the next message.
    pub fn on_open_streams<F>(&self, handler: F)
    where
        F: Fn(u32, &OpenStreams) -> Result<(), DevcastError> + Send + Sync + 'static,
    {
        self.dispatcher.handlers.lock().open = Some(Arc::new(handler));
    }

    /// Replace the close-streams handler. Takes effect for the next message.
    pub fn on_close_streams<F>(&self, handler: F)
    where
        F: Fn(u32, &CloseStreams) -> Result<(), DevcastError> + Send + Sync + 'static,
    {
        self.dispatcher.handlers.lock().close = Some(Arc::new(handler));
    }

    /// Become a reader of the control topic and spawn the dispatch task.
    ///
    /// # Errors
    ///
    /// [`DevcastError::InvalidState`] when the channel is not idle or when no
    /// Tokio runtime is available.
    pub fn start(&self) -> Result<(), DevcastError> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Idle {
            return Err(DevcastError::InvalidState(format!(
                "control channel is {}",
                state.lifecycle
            )));
        }
        let runtime = Handle::try_current().map_err(|_| {
            DevcastError::InvalidState("control channel needs a Tokio runtime".to_string())
        })?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<Bytes>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        runtime.spawn(run_dispatch(Arc::clone(&self.dispatcher), raw_rx, shutdown_rx));

        let messages = self.transport.on_message(
            &self.dispatcher.topic,
            Box::new(move |raw: Bytes| {
                let _ = raw_tx.send(raw);
            }),
        );

        state.running = Some(Running {
            shutdown: shutdown_tx,
            _messages: messages,
        });
        state.lifecycle = Lifecycle::Running;
        info!(topic = %self.dispatcher.topic, "control channel started");
        Ok(())
    }

    /// Stop reading. Messages not yet dispatched are dropped.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(running) = state.running.take() {
            let _ = running.shutdown.send(());
            info!(topic = %self.dispatcher.topic, "control channel stopped");
        }
        state.lifecycle = Lifecycle::Stopped;
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn topic(&self) -> &str {
        &self.dispatcher.topic
    }

    /// Messages handed to a handler that returned `Ok`.
    pub fn dispatched(&self) -> u64 {
        self.dispatcher.dispatched.load(Ordering::Relaxed)
    }

    /// Messages that failed to parse, had no handler, or whose handler failed.
    pub fn rejected(&self) -> u64 {
        self.dispatcher.rejected.load(Ordering::Relaxed)
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_dispatch(
    dispatcher: Arc<Dispatcher>,
    mut raw: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            next = raw.recv() => match next {
                Some(bytes) => dispatcher.dispatch(&bytes),
                None => break,
            },
        }
    }
    debug!(topic = %dispatcher.topic, "control dispatch task exited");
}

// ────────────────────────────────────────────────────────────────────────────
// Client side
// ────────────────────────────────────────────────────────────────────────────

/// Sends control commands to a device, numbering them with increasing ids.
pub struct ControlClient {
    transport: Arc<dyn Transport>,
    topic: String,
    next_id: AtomicU32,
}

impl ControlClient {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Ask the device to open `profiles` on `sensor_id`. Returns the message id.
    ///
    /// # Errors
    ///
    /// [`DevcastError::ProfileLimit`] for more than eight profiles, or the
    /// transport's publish error.
    pub fn open_streams(
        &self,
        sensor_id: i16,
        profiles: Vec<StreamProfile>,
    ) -> Result<u32, DevcastError> {
        let open = OpenStreams::new(sensor_id, profiles)?;
        self.send(ControlCommand::OpenStreams(open))
    }

    pub fn close_streams(&self, sensor_id: i16) -> Result<u32, DevcastError> {
        self.send(ControlCommand::CloseStreams(CloseStreams { sensor_id }))
    }

    fn send(&self, command: ControlCommand) -> Result<u32, DevcastError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let readers = self
            .transport
            .publish(&self.topic, ControlMessage::new(id, command).encode())?;
        if readers == 0 {
            warn!(topic = %self.topic, id, "control message sent with no device listening");
        }
        Ok(id)
    }
}
