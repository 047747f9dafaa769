//! Configuration for the delivery engine and the `courier` CLI.
//!
//! [`DeliveryConfig`] holds the engine's tunables and can be built directly.
//! The CLI resolves a [`ClientConfig`] from layered sources, highest first:
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courier/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::queue::BackoffPolicy;

/// Default docstore endpoint.
pub const DEFAULT_DOCSTORE_URL: &str = "ws://127.0.0.1:9100/ws";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

/// Tunables of the delivery engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Backoff after the first failed write.
    pub initial_retry_delay: Duration,
    /// Upper bound on the backoff.
    pub max_retry_delay: Duration,
    /// Write attempts before a message fails.
    pub max_attempts: u32,
    /// Period of the status propagator's flush.
    pub flush_interval: Duration,
    /// Status updates written per flush.
    pub flush_batch_size: usize,
    /// Time in `sending` after which a message is forced to `failed`.
    pub stale_timeout: Duration,
    /// Fraction of a message that must be on screen to count as visible.
    pub visibility_threshold: f32,
    /// How long a message must stay visible to count as read.
    pub visibility_dwell: Duration,
    /// Concurrent message writes.
    pub max_in_flight: usize,
    /// Minimum backoff after a quota error.
    pub quota_backoff_floor: Duration,
    /// Period of the stale sweep.
    pub stale_sweep_interval: Duration,
    /// Propagator depth above which the flush period halves.
    pub backlog_threshold: usize,
    /// Remote collection holding message documents.
    pub collection: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(120),
            max_attempts: 5,
            flush_interval: Duration::from_secs(2),
            flush_batch_size: 3,
            stale_timeout: Duration::from_secs(5 * 60),
            visibility_threshold: 0.5,
            visibility_dwell: Duration::from_secs(1),
            max_in_flight: 3,
            quota_backoff_floor: Duration::from_secs(30),
            stale_sweep_interval: Duration::from_secs(30),
            backlog_threshold: 10,
            collection: "messages".to_string(),
        }
    }
}

impl DeliveryConfig {
    /// Retry schedule derived from this configuration.
    #[must_use]
    pub const fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: self.initial_retry_delay,
            max: self.max_retry_delay,
            max_attempts: self.max_attempts,
            quota_floor: self.quota_backoff_floor,
        }
    }

    /// Rejects settings the workers cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if self.max_in_flight == 0 {
            return Err(invalid("max_in_flight", "must be at least 1"));
        }
        if self.flush_batch_size == 0 {
            return Err(invalid("flush_batch_size", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.visibility_threshold) {
            return Err(invalid("visibility_threshold", "must be within 0.0..=1.0"));
        }
        for (field, period) in [
            ("flush_interval", self.flush_interval),
            ("stale_sweep_interval", self.stale_sweep_interval),
        ] {
            if period.is_zero() {
                return Err(invalid(field, "must be non-zero"));
            }
        }
        if self.collection.is_empty() {
            return Err(invalid("collection", "must not be empty"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    delivery: DeliveryFileConfig,
    remote: RemoteFileConfig,
    storage: StorageFileConfig,
}

/// `[delivery]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DeliveryFileConfig {
    initial_retry_delay_ms: Option<u64>,
    max_retry_delay_secs: Option<u64>,
    max_attempts: Option<u32>,
    flush_interval_ms: Option<u64>,
    flush_batch_size: Option<usize>,
    stale_timeout_secs: Option<u64>,
    visibility_threshold: Option<f32>,
    visibility_dwell_ms: Option<u64>,
    max_in_flight: Option<usize>,
    quota_backoff_floor_secs: Option<u64>,
    stale_sweep_interval_secs: Option<u64>,
    backlog_threshold: Option<usize>,
    collection: Option<String>,
}

/// `[remote]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RemoteFileConfig {
    docstore_url: Option<String>,
    request_timeout_secs: Option<u64>,
    sender: Option<String>,
    conversation: Option<String>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    data_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved CLI configuration
// ---------------------------------------------------------------------------

/// Fully resolved CLI configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Docstore WebSocket URL.
    pub docstore_url: String,
    /// Timeout for one docstore request.
    pub request_timeout: Duration,
    /// Account to send as.
    pub sender: Option<String>,
    /// Conversation to send to or watch.
    pub conversation: Option<String>,
    /// Directory for the persisted outbox.
    pub data_dir: PathBuf,
    /// Engine tunables.
    pub delivery: DeliveryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            docstore_url: DEFAULT_DOCSTORE_URL.to_string(),
            request_timeout: Duration::from_secs(10),
            sender: None,
            conversation: None,
            data_dir: default_data_dir(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if the resolved delivery settings are invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.delivery.validate()?;
        Ok(config)
    }

    /// Resolve from CLI args and a parsed config file. Priority: CLI >
    /// file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let d = &file.delivery;
        let dd = defaults.delivery;

        Self {
            docstore_url: cli
                .docstore_url
                .clone()
                .or_else(|| file.remote.docstore_url.clone())
                .unwrap_or(defaults.docstore_url),
            request_timeout: file
                .remote
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            sender: cli.sender.clone().or_else(|| file.remote.sender.clone()),
            conversation: cli
                .conversation
                .clone()
                .or_else(|| file.remote.conversation.clone()),
            data_dir: cli
                .data_dir
                .clone()
                .or_else(|| file.storage.data_dir.clone())
                .unwrap_or(defaults.data_dir),
            delivery: DeliveryConfig {
                initial_retry_delay: d
                    .initial_retry_delay_ms
                    .map_or(dd.initial_retry_delay, Duration::from_millis),
                max_retry_delay: d
                    .max_retry_delay_secs
                    .map_or(dd.max_retry_delay, Duration::from_secs),
                max_attempts: d.max_attempts.unwrap_or(dd.max_attempts),
                flush_interval: d
                    .flush_interval_ms
                    .map_or(dd.flush_interval, Duration::from_millis),
                flush_batch_size: d.flush_batch_size.unwrap_or(dd.flush_batch_size),
                stale_timeout: d
                    .stale_timeout_secs
                    .map_or(dd.stale_timeout, Duration::from_secs),
                visibility_threshold: d.visibility_threshold.unwrap_or(dd.visibility_threshold),
                visibility_dwell: d
                    .visibility_dwell_ms
                    .map_or(dd.visibility_dwell, Duration::from_millis),
                max_in_flight: d.max_in_flight.unwrap_or(dd.max_in_flight),
                quota_backoff_floor: d
                    .quota_backoff_floor_secs
                    .map_or(dd.quota_backoff_floor, Duration::from_secs),
                stale_sweep_interval: d
                    .stale_sweep_interval_secs
                    .map_or(dd.stale_sweep_interval, Duration::from_secs),
                backlog_threshold: d.backlog_threshold.unwrap_or(dd.backlog_threshold),
                collection: d.collection.clone().unwrap_or(dd.collection),
            },
        }
    }
}

/// What the CLI should do.
#[derive(clap::Subcommand, Debug, Clone, Default, PartialEq, Eq)]
pub enum Command {
    /// Send a text message and follow its status.
    Send {
        /// Message text.
        text: String,
        /// Seconds to wait for delivery before giving up.
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Watch the conversation, acknowledging and reading inbound messages.
    Listen {
        /// Simulated on-screen time before a message counts as read.
        #[arg(long, default_value_t = 1500)]
        dwell_ms: u64,
    },
    /// List messages still waiting in the outbox.
    #[default]
    Pending,
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Message delivery tracking over a document store")]
pub struct CliArgs {
    /// What to do.
    #[command(subcommand)]
    pub command: Command,

    /// WebSocket URL of the docstore.
    #[arg(long, env = "COURIER_DOCSTORE_URL")]
    pub docstore_url: Option<String>,

    /// Account to send as.
    #[arg(long, env = "COURIER_SENDER")]
    pub sender: Option<String>,

    /// Conversation id (UUID).
    #[arg(long, env = "COURIER_CONVERSATION")]
    pub conversation: Option<String>,

    /// Path to config file (default: `~/.config/courier/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory for the persisted outbox.
    #[arg(long, env = "COURIER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURIER_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/courier.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Print status events as JSON lines.
    #[arg(long)]
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("courier")
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("courier").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
