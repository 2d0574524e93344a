//! `devcast-sync` – sample/metadata pairing.
//!
//! Samples and their metadata travel on separate paths from the device and
//! arrive independently. [`MetadataSyncer`] pairs them by key before a
//! stream publishes them, with bounded queues on both sides.
//!
//! # Modules
//!
//! - [`syncer`] – [`MetadataSyncer`][syncer::MetadataSyncer] and
//!   [`MatchedPair`][syncer::MatchedPair].

pub mod syncer;

pub use syncer::{
    MatchedPair, MetadataSyncer, DEFAULT_MAX_METADATA_QUEUE_SIZE, DEFAULT_MAX_SAMPLE_QUEUE_SIZE,
};
