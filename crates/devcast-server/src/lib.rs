//! `devcast-server` – the composition root exposing one device.
//!
//! # Modules
//!
//! - [`device_server`] – [`DeviceServer`]: presence, control, notifications and
//!   streams of one device behind a single handle.
//! - [`stream`] – [`StreamPublisher`]: pairs images with metadata and publishes
//!   the resulting frames.
//! - [`telemetry`] – `tracing` subscriber set-up with optional OTLP export.

pub mod device_server;
pub mod stream;
pub mod telemetry;

pub use device_server::{CloseStreamsRequest, DeviceServer, OpenStreamsRequest, ServerOptions};
pub use stream::StreamPublisher;
