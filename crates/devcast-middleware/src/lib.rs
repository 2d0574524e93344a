//! `devcast-middleware` – moving bytes between a device and its clients.
//!
//! Everything here talks to the network through the [`Transport`] trait and
//! hands transport callbacks off to Tokio tasks.
//!
//! # Modules
//!
//! - [`transport`] – The [`Transport`] trait, [`Subscription`] guards and
//!   [`TopicReceiver`] reader handles.
//! - [`local`] – [`LocalTransport`], an in-process transport for tests and demos.
//! - [`notification`] – [`NotificationChannel`]: on-demand and on-discovery
//!   device notifications.
//! - [`control`] – [`ControlChannel`] and [`ControlClient`]: open/close stream
//!   commands.
//! - [`presence`] – [`PresenceBroadcaster`]: device announcement, re-announcement
//!   and disconnect.
//! - [`lifecycle`] – shared `Idle → Running → Stopped` state.

pub mod control;
pub mod lifecycle;
pub mod local;
pub mod notification;
pub mod presence;
pub mod transport;

pub use control::{CloseStreamsHandler, ControlChannel, ControlClient, OpenStreamsHandler};
pub use lifecycle::Lifecycle;
pub use local::LocalTransport;
pub use notification::{DEFAULT_NOTIFICATION_QUEUE_CAPACITY, NotificationChannel};
pub use presence::{
    AckCallback, BroadcastState, BroadcasterOptions, DEFAULT_ACK_TIMEOUT, PresenceBroadcaster,
};
pub use transport::{MatchCallback, MatchEvent, MessageCallback, Subscription, TopicReceiver, Transport};
