//! Virtual device session driven by the `devcast` binary.
//!
//! A [`DeviceServer`] is exposed on an in-process [`LocalTransport`], together
//! with a small client that watches presence, prints notifications, opens
//! every configured stream and counts the frames it receives. A synthetic
//! generator feeds images and metadata while streams are open.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use colored::Colorize;
use devcast_middleware::{ControlClient, LocalTransport, TopicReceiver, Transport};
use devcast_server::DeviceServer;
use devcast_types::{
    CONTROL_TOPIC, DEVICE_INFO_TOPIC, DevcastError, DeviceInfoMessage, ImageHeader,
    MAX_OPEN_PROFILES, MetadataMap, NOTIFICATION_TOPIC, PresenceState, StreamFrame, StreamProfile,
};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Payload bytes per synthetic image. Real sizes do not matter in-process.
const SYNTHETIC_PAYLOAD_LEN: usize = 256;

/// Shortest tick of the synthetic generator.
const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(1);

/// Run until `stop` flips to `true`, then disconnect and shut down.
pub async fn run(cfg: Config, mut stop: watch::Receiver<bool>) -> Result<(), DevcastError> {
    let transport = LocalTransport::new();
    let shared: Arc<dyn Transport> = Arc::new(transport.clone());
    let identity = cfg.identity();

    let mut presence = transport.subscribe(DEVICE_INFO_TOPIC);
    let server = DeviceServer::new(
        Arc::clone(&shared),
        identity.clone(),
        cfg.server_options()
            .with_ack_callback(|| info!("device announcement acknowledged")),
    )?;
    server.init(cfg.descriptors())?;
    install_handlers(&server, cfg.locked);

    let mut notifications = transport.subscribe(&identity.topic(NOTIFICATION_TOPIC));
    let monitors: Vec<(String, JoinHandle<u64>)> = cfg
        .streams
        .iter()
        .map(|stream| {
            let reader = transport.subscribe(&identity.topic(&stream.name));
            let handle = tokio::spawn(count_frames(reader, stop.clone()));
            (stream.name.clone(), handle)
        })
        .collect();

    let client = ControlClient::new(Arc::clone(&shared), identity.topic(CONTROL_TOPIC));
    for (sensor_id, profiles) in cfg.profiles_by_sensor() {
        let ids = open_all(&client, sensor_id, &profiles)?;
        debug!(sensor_id, message_ids = ?ids, "open requested");
    }

    let producer = tokio::spawn(produce(server.clone(), frame_interval(&cfg), stop.clone()));

    println!(
        "  {} {} on {}",
        "▶".green().bold(),
        identity.name().bold(),
        identity.topic_root().cyan()
    );
    println!("  Press {} to disconnect.\n", "Ctrl-C".bold());

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            Some(raw) = presence.recv() => print_presence(&raw),
            Some(raw) = notifications.recv() => print_notification(&raw),
        }
    }

    let produced = producer.await.unwrap_or_else(|e| {
        warn!(error = %e, "producer task failed");
        0
    });
    for (sensor_id, _) in cfg.profiles_by_sensor() {
        if let Err(e) = client.close_streams(sensor_id) {
            warn!(sensor_id, error = %e, "close request failed");
        }
    }

    let acked = server.broadcast_disconnect(cfg.disconnect_timeout()).await;
    server.shutdown();

    println!();
    println!("  {} images produced", produced.to_string().bold());
    for (name, handle) in monitors {
        let frames = handle.await.unwrap_or(0);
        println!("    {:<12} {} frames received", name, frames);
    }
    if acked {
        println!("  {} Disconnect acknowledged.", "✓".green().bold());
    } else {
        println!("  {} Disconnect not acknowledged within {:?}.", "!".yellow().bold(), cfg.disconnect_timeout());
    }
    Ok(())
}

/// Remote open/close requests start and stop the addressed streams. A
/// locked device refuses to open anything.
fn install_handlers(server: &DeviceServer, locked: bool) {
    server.on_open_streams(move |server, request| {
        if locked {
            return Err(DevcastError::InvalidState(format!(
                "device is locked; open request {} refused",
                request.message_id
            )));
        }
        for (name, profile) in &request.streams {
            server.start_streaming(name, ImageHeader::from(profile))?;
        }
        info!(message_id = request.message_id, streams = request.streams.len(), "streams opened");
        Ok(())
    });
    server.on_close_streams(|server, request| {
        for name in &request.stream_names {
            server.stop_streaming(name)?;
        }
        info!(message_id = request.message_id, sensor_id = request.sensor_id, "streams closed");
        Ok(())
    });
}

/// Open `profiles` with as many messages as the per-message profile limit
/// requires.
fn open_all(
    client: &ControlClient,
    sensor_id: i16,
    profiles: &[StreamProfile],
) -> Result<Vec<u32>, DevcastError> {
    profiles
        .chunks(MAX_OPEN_PROFILES)
        .map(|chunk| client.open_streams(sensor_id, chunk.to_vec()))
        .collect()
}

fn frame_interval(cfg: &Config) -> Duration {
    let fastest = cfg.streams.iter().map(|s| s.framerate).max().unwrap_or(30).max(1);
    Duration::from_micros(1_000_000 / fastest as u64).max(MIN_FRAME_INTERVAL)
}

/// Feed every streaming stream one image and its metadata per tick.
async fn produce(server: DeviceServer, interval: Duration, mut stop: watch::Receiver<bool>) -> u64 {
    let mut ticker = tokio::time::interval(interval);
    let mut key: u64 = 0;
    let mut produced = 0;
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        key += 1;
        for stream in server.streams().into_iter().filter(|s| s.is_streaming()) {
            let payload = Bytes::from(vec![(key % 251) as u8; SYNTHETIC_PAYLOAD_LEN]);
            let mut metadata = MetadataMap::new();
            metadata.insert("frame-number".into(), json!(key));
            metadata.insert("timestamp".into(), json!(chrono::Utc::now().timestamp_micros()));

            let sent = server
                .publish_image(&stream.name, key, payload)
                .and_then(|()| server.publish_metadata(&stream.name, key, metadata));
            match sent {
                Ok(()) => produced += 1,
                Err(e) => warn!(stream = %stream.name, key, error = %e, "synthetic frame rejected"),
            }
        }
    }
    produced
}

async fn count_frames(mut reader: TopicReceiver, mut stop: watch::Receiver<bool>) -> u64 {
    let mut frames = 0;
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            next = reader.recv() => match next.map(StreamFrame::decode) {
                Some(Ok(frame)) => {
                    frames += 1;
                    if frames % 100 == 0 {
                        debug!(topic = %reader.topic(), key = frame.key, frames, "frames received");
                    }
                }
                Some(Err(e)) => warn!(topic = %reader.topic(), error = %e, "undecodable frame"),
                None => break,
            },
        }
    }
    frames
}

fn print_presence(raw: &[u8]) {
    match DeviceInfoMessage::from_bytes(raw) {
        Ok(info) => {
            let state = match info.state {
                PresenceState::Connected => "connected".green(),
                PresenceState::Disconnected => "disconnected".yellow(),
            };
            println!("  {} {} ({}) {}", "●".cyan(), info.name.bold(), info.serial_number, state);
        }
        Err(e) => warn!(error = %e, "unreadable presence message"),
    }
}

fn print_notification(raw: &[u8]) {
    match serde_json::from_slice::<serde_json::Value>(raw) {
        Ok(body) => {
            let id = body["id"].as_str().unwrap_or("notification");
            let name = body["name"].as_str().unwrap_or_default();
            println!("  {} {} {}", "✉".dimmed(), id.bold(), name);
        }
        Err(e) => warn!(error = %e, "unreadable notification"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use devcast_types::{ControlCommand, ControlMessage, SampleFormat, StreamType};

    fn stream(name: &str, framerate: i16) -> StreamConfig {
        StreamConfig {
            name: name.to_string(),
            stream_type: StreamType::Depth,
            sensor_id: 0,
            format: SampleFormat::Z16,
            width: 640,
            height: 480,
            framerate,
        }
    }

    #[test]
    fn frame_interval_follows_the_fastest_stream() {
        let mut cfg = Config::default();
        cfg.streams = vec![stream("Depth", 30), stream("Infrared", 60)];
        assert_eq!(frame_interval(&cfg), Duration::from_micros(16_666));
    }

    #[test]
    fn frame_interval_never_reaches_zero() {
        let mut cfg = Config::default();
        cfg.streams = vec![stream("Depth", 2000)];
        assert_eq!(frame_interval(&cfg), MIN_FRAME_INTERVAL);

        cfg.streams = vec![stream("Depth", i16::MAX)];
        assert!(!frame_interval(&cfg).is_zero());

        cfg.streams = vec![stream("Depth", -5)];
        assert_eq!(frame_interval(&cfg), Duration::from_secs(1));
    }

    #[test]
    fn large_open_request_is_split_across_messages() -> Result<(), Box<dyn std::error::Error>> {
        let transport = LocalTransport::new();
        let mut control = transport.subscribe("dev/control");
        let client = ControlClient::new(Arc::new(transport.clone()), "dev/control");

        let profiles: Vec<StreamProfile> = (0..MAX_OPEN_PROFILES + 3)
            .map(|i| stream(&format!("s{i}"), 30).profile())
            .collect();
        let ids = open_all(&client, 2, &profiles)?;
        assert_eq!(ids.len(), 2);

        let mut counts = Vec::new();
        while let Some(raw) = control.try_recv() {
            match ControlMessage::decode(&raw)?.command {
                ControlCommand::OpenStreams(open) => {
                    assert_eq!(open.sensor_id(), 2);
                    counts.push(open.profiles().len());
                }
                other => return Err(format!("unexpected command {other:?}").into()),
            }
        }
        assert_eq!(counts, vec![MAX_OPEN_PROFILES, 3]);
        Ok(())
    }
}
