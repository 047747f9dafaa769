//! Docstore server settings.
//!
//! Each setting comes from the first source that has it: command line,
//! environment (`DOCSTORE_*`), the `[server]` table of
//! `~/.config/courier/docstore.toml`, then the built-in default. Limits are
//! checked here so the server never starts with a store that refuses every
//! write.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::documents::{DEFAULT_MAX_DOCUMENT_SIZE, DocumentStore};
use crate::server::{DEFAULT_WRITES_PER_MINUTE, DocstoreState};

const DEFAULT_BIND: &str = "0.0.0.0:9100";

/// Why the settings could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    ReadFile {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for this server.
    #[error("invalid settings file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The bind address is not `host:port`.
    #[error("invalid bind address {value:?}: {source}")]
    Bind {
        /// Address as given.
        value: String,
        /// Parse failure.
        source: std::net::AddrParseError,
    },

    /// A zero document size would refuse every write.
    #[error("max_document_size must be greater than zero")]
    ZeroDocumentSize,
}

/// Contents of the settings file; every key is optional.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SettingsFile {
    server: ServerTable,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerTable {
    bind_addr: Option<String>,
    max_document_size: Option<usize>,
    writes_per_minute: Option<u32>,
}

/// Command line of `courier-docstore`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Courier reference document store")]
pub struct DocstoreCliArgs {
    /// Listen address, `host:port`.
    #[arg(short, long, env = "DOCSTORE_ADDR")]
    pub bind: Option<String>,

    /// Settings file (default: `~/.config/courier/docstore.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest accepted document, in approximate encoded bytes.
    #[arg(long, env = "DOCSTORE_MAX_DOCUMENT_SIZE")]
    pub max_document_size: Option<usize>,

    /// Creates and updates allowed per connection per minute; 0 disables
    /// the quota.
    #[arg(long, env = "DOCSTORE_WRITES_PER_MINUTE")]
    pub writes_per_minute: Option<u32>,

    /// Log filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "DOCSTORE_LOG")]
    pub log_level: String,
}

/// Settings the server runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocstoreConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Largest accepted document, in approximate encoded bytes.
    pub max_document_size: usize,
    /// Per-connection write quota; 0 is unlimited.
    pub writes_per_minute: u32,
    /// Log filter.
    pub log_level: String,
}

impl DocstoreConfig {
    /// Reads the settings file and merges it under the command line.
    ///
    /// A file named with `--config` must exist; the default file may be
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or a
    /// merged value is invalid.
    pub fn load(cli: &DocstoreCliArgs) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => read_settings(path)?,
            None => match default_path() {
                Some(path) if path.exists() => read_settings(&path)?,
                _ => SettingsFile::default(),
            },
        };
        Self::merge(cli, file)
    }

    fn merge(cli: &DocstoreCliArgs, file: SettingsFile) -> Result<Self, ConfigError> {
        let ServerTable {
            bind_addr,
            max_document_size,
            writes_per_minute,
        } = file.server;

        let bind = cli
            .bind
            .clone()
            .or(bind_addr)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind_addr = bind
            .parse()
            .map_err(|source| ConfigError::Bind { value: bind, source })?;

        let max_document_size = cli
            .max_document_size
            .or(max_document_size)
            .unwrap_or(DEFAULT_MAX_DOCUMENT_SIZE);
        if max_document_size == 0 {
            return Err(ConfigError::ZeroDocumentSize);
        }

        Ok(Self {
            bind_addr,
            max_document_size,
            writes_per_minute: cli
                .writes_per_minute
                .or(writes_per_minute)
                .unwrap_or(DEFAULT_WRITES_PER_MINUTE),
            log_level: cli.log_level.clone(),
        })
    }

    /// Server state with these limits and an empty store.
    #[must_use]
    pub fn state(&self) -> DocstoreState {
        DocstoreState::with_config(
            DocumentStore::with_max_document_size(self.max_document_size),
            self.writes_per_minute,
        )
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("courier").join("docstore.toml"))
}

fn read_settings(path: &Path) -> Result<SettingsFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}
