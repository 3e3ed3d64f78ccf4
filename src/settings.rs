use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// What a capture worker does when the fan-in channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressurePolicy {
    /// Block the capture loop until the writer catches up. No record loss.
    Stall,
    /// Discard the record and count it. Keeps the capture loop live.
    DropAndCount,
}

/// How partially decoded frames are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrictnessMode {
    /// Forward records even when a layer could not be decoded.
    Permissive,
    /// Drop frames lacking a decodable IPv4 network layer or a decodable
    /// transport layer. The high-volume collection profile.
    Ipv4OnlyStrict,
}

/// Application configuration, loaded from `config/default.toml` over coded
/// defaults, with `NETLOGGER_*` environment variable overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Interfaces to capture on. Empty means every device found.
    pub interfaces: Vec<String>,
    pub snapshot_length: i32,
    pub promiscuous: bool,
    /// Capture read timeout. Also bounds how long a worker takes to observe
    /// a shutdown request with no traffic, so it is configuration, not a
    /// constant.
    pub read_timeout_ms: i32,
    pub filter: String,
    pub max_batch_records: usize,
    #[serde(default)]
    pub max_batch_duration_secs: Option<u64>,
    #[serde(default)]
    pub max_batch_bytes: Option<u64>,
    pub channel_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub strictness: StrictnessMode,
    /// Whether an empty application payload still gets a digest (the sha256
    /// of zero bytes) or none at all.
    pub hash_empty_payload: bool,
    pub output_dir: String,
    pub progress_interval: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            interfaces: Vec::new(),
            snapshot_length: 65535,
            promiscuous: true,
            read_timeout_ms: 1000,
            filter: "tcp or udp".to_string(),
            max_batch_records: 10000,
            max_batch_duration_secs: None,
            max_batch_bytes: None,
            channel_capacity: 1000,
            backpressure: BackpressurePolicy::Stall,
            strictness: StrictnessMode::Permissive,
            hash_empty_payload: false,
            output_dir: ".".to_string(),
            progress_interval: 100,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Loads configuration: coded defaults, then the config file if present,
    /// then environment variables.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("config/default")
    }

    pub fn from_file(name: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::with_name(name).required(false))
            .add_source(Environment::with_prefix("NETLOGGER"))
            .build()?
            .try_deserialize()
    }
}
