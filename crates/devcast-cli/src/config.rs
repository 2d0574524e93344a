//! Device configuration – reads/writes `~/.devcast/config.toml`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use devcast_server::ServerOptions;
use devcast_types::{
    DEFAULT_TOPIC_PREFIX, DeviceIdentity, SampleFormat, StreamDescriptor, StreamProfile,
    StreamType,
};

/// One stream the device exposes, with the profile clients open it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub stream_type: StreamType,
    #[serde(default)]
    pub sensor_id: i16,
    pub format: SampleFormat,
    pub width: i16,
    pub height: i16,
    #[serde(default = "default_framerate")]
    pub framerate: i16,
}

impl StreamConfig {
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor::new(self.name.clone(), self.stream_type, self.sensor_id)
    }

    pub fn profile(&self) -> StreamProfile {
        StreamProfile {
            framerate: self.framerate,
            format: self.format,
            stream_type: self.stream_type,
            width: self.width,
            height: self.height,
        }
    }
}

/// Persisted device configuration stored in `~/.devcast/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default = "default_serial_number")]
    pub serial_number: String,

    #[serde(default = "default_product_line")]
    pub product_line: String,

    /// First segment of every topic root (`<prefix>/<model>/<serial>`).
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// A locked device refuses remote open-streams requests.
    #[serde(default)]
    pub locked: bool,

    #[serde(default = "default_queue_size")]
    pub max_sample_queue_size: usize,

    #[serde(default = "default_queue_size")]
    pub max_metadata_queue_size: usize,

    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,

    /// Kept last so the TOML array of tables follows every plain value.
    #[serde(default = "default_streams")]
    pub streams: Vec<StreamConfig>,
}

fn default_device_name() -> String {
    "Devcast Virtual D435".to_string()
}
fn default_serial_number() -> String {
    "000000000001".to_string()
}
fn default_product_line() -> String {
    "D400".to_string()
}
fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}
fn default_framerate() -> i16 {
    30
}
fn default_queue_size() -> usize {
    8
}
fn default_notification_capacity() -> usize {
    64
}
fn default_ack_timeout_ms() -> u64 {
    1000
}
fn default_disconnect_timeout_ms() -> u64 {
    1000
}

fn default_streams() -> Vec<StreamConfig> {
    vec![
        StreamConfig {
            name: "Depth".to_string(),
            stream_type: StreamType::Depth,
            sensor_id: 0,
            format: SampleFormat::Z16,
            width: 640,
            height: 480,
            framerate: 30,
        },
        StreamConfig {
            name: "Infrared".to_string(),
            stream_type: StreamType::Ir,
            sensor_id: 0,
            format: SampleFormat::Y8,
            width: 640,
            height: 480,
            framerate: 30,
        },
        StreamConfig {
            name: "Color".to_string(),
            stream_type: StreamType::Color,
            sensor_id: 1,
            format: SampleFormat::Rgb8,
            width: 1280,
            height: 720,
            framerate: 30,
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            serial_number: default_serial_number(),
            product_line: default_product_line(),
            topic_prefix: default_topic_prefix(),
            locked: false,
            streams: default_streams(),
            max_sample_queue_size: default_queue_size(),
            max_metadata_queue_size: default_queue_size(),
            notification_capacity: default_notification_capacity(),
            ack_timeout_ms: default_ack_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
        }
    }
}

impl Config {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::with_prefix(
            &self.topic_prefix,
            &self.device_name,
            &self.serial_number,
            &self.product_line,
            self.locked,
        )
    }

    pub fn descriptors(&self) -> Vec<StreamDescriptor> {
        self.streams.iter().map(StreamConfig::descriptor).collect()
    }

    /// Stream profiles grouped by sensor, as a client would request them.
    pub fn profiles_by_sensor(&self) -> BTreeMap<i16, Vec<StreamProfile>> {
        let mut grouped: BTreeMap<i16, Vec<StreamProfile>> = BTreeMap::new();
        for stream in &self.streams {
            grouped.entry(stream.sensor_id).or_default().push(stream.profile());
        }
        grouped
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions::default()
            .with_queue_sizes(self.max_sample_queue_size, self.max_metadata_queue_size)
            .with_notification_capacity(self.notification_capacity)
            .with_ack_timeout(self.ack_timeout())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

/// Return the path to `~/.devcast/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".devcast").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `DEVCAST_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `DEVCAST_DEVICE_NAME` | `device_name` |
/// | `DEVCAST_SERIAL` | `serial_number` |
/// | `DEVCAST_TOPIC_PREFIX` | `topic_prefix` |
/// | `DEVCAST_ACK_TIMEOUT_MS` | `ack_timeout_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("DEVCAST_DEVICE_NAME") {
        cfg.device_name = v;
    }
    if let Ok(v) = std::env::var("DEVCAST_SERIAL") {
        cfg.serial_number = v;
    }
    if let Ok(v) = std::env::var("DEVCAST_TOPIC_PREFIX") {
        cfg.topic_prefix = v;
    }
    if let Ok(v) = std::env::var("DEVCAST_ACK_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.ack_timeout_ms = ms;
    }
}

/// Save the config to disk, creating `~/.devcast/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
