//! Configuration module
//!
//! Two kinds of configuration live here: the local YAML file that tells the
//! relay where to listen and where to poll, and the remote JSON document
//! ([`remote`]) that carries the fallback endpoints themselves.

pub mod remote;

pub use remote::{FallbackSpec, PollWindow, RemoteConfig, ValidatedConfig, ValidatedFallback};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default local listen address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

/// File holding the per-user path segment of the remote config URL
pub const DEFAULT_URL_FILE: &str = ".lantern-configurl.txt";

/// Base URL the path segment is appended to
pub const DEFAULT_CONFIG_BASE: &str = "https://s3-ap-southeast-1.amazonaws.com/lantern-config/";

/// How the TLS connection to a fallback is authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustMode {
    /// The server must present exactly the distributed certificate.
    /// Hostname and validity-period checks are waived: fallback certificates
    /// do not carry the IP SANs the relay dials by.
    #[default]
    Pinned,
    /// Standard WebPKI chain and hostname verification, with the distributed
    /// certificate as the only trust anchor.
    Verified,
}

/// Which fallback a new session is sent to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    /// Always the first fallback in the document
    #[default]
    First,
    /// Cycle through fallbacks in document order
    RoundRobin,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local proxy listen address
    pub listen: String,

    /// Remote configuration URL (takes precedence over the URL file)
    #[serde(rename = "config-url")]
    pub config_url: Option<String>,

    /// File containing the path segment of the remote configuration URL
    #[serde(rename = "config-url-file")]
    pub config_url_file: String,

    /// Base URL the path segment is appended to
    #[serde(rename = "config-base")]
    pub config_base: String,

    /// Poll window used until a document supplies its own
    #[serde(rename = "min-poll-minutes")]
    pub min_poll_minutes: u64,

    #[serde(rename = "max-poll-minutes")]
    pub max_poll_minutes: u64,

    /// Remote config request timeout
    #[serde(rename = "fetch-timeout-secs")]
    pub fetch_timeout_secs: u64,

    /// Deadline for reading a client's request head
    #[serde(rename = "read-timeout-secs")]
    pub read_timeout_secs: u64,

    /// Deadline for writes made before the splice starts
    #[serde(rename = "write-timeout-secs")]
    pub write_timeout_secs: u64,

    /// TCP connect timeout towards a fallback
    #[serde(rename = "dial-timeout-secs")]
    pub dial_timeout_secs: u64,

    /// TLS handshake timeout towards a fallback
    #[serde(rename = "handshake-timeout-secs")]
    pub handshake_timeout_secs: u64,

    /// Fallback certificate trust mode
    #[serde(rename = "trust-mode")]
    pub trust_mode: TrustMode,

    /// Fallback selection policy
    pub selection: SelectionMode,

    /// Hold off accepting clients until the first document has been applied
    #[serde(rename = "wait-for-config")]
    pub wait_for_config: bool,

    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from a file that must exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Unable to read {}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    /// Load from file, or fall back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        PollWindow::new(self.min_poll_minutes, self.max_poll_minutes)?;

        let timeouts = [
            ("fetch-timeout-secs", self.fetch_timeout_secs),
            ("read-timeout-secs", self.read_timeout_secs),
            ("write-timeout-secs", self.write_timeout_secs),
            ("dial-timeout-secs", self.dial_timeout_secs),
            ("handshake-timeout-secs", self.handshake_timeout_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                return Err(Error::config(format!("{} must be positive", name)));
            }
        }

        if let Some(ref url) = self.config_url {
            validate_url(url)?;
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| Error::config(format!("Invalid listen address {}: {}", self.listen, e)))
    }

    /// Initial poll window
    pub fn poll_window(&self) -> PollWindow {
        PollWindow {
            min_minutes: self.min_poll_minutes,
            max_minutes: self.max_poll_minutes,
        }
    }

    /// Resolve the remote configuration URL.
    ///
    /// An explicit `config-url` wins; otherwise the URL is
    /// `<config-base><contents of config-url-file>/config.json`.
    pub fn resolve_config_url(&self) -> Result<String> {
        if let Some(ref url) = self.config_url {
            return Ok(url.clone());
        }

        let segment = std::fs::read_to_string(&self.config_url_file).map_err(|e| {
            Error::config(format!(
                "Unable to read {}. Make sure it exists in the working directory: {}",
                self.config_url_file, e
            ))
        })?;
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(Error::config(format!("{} is empty", self.config_url_file)));
        }

        let url = format!("{}{}/config.json", self.config_base, segment);
        validate_url(&url)?;
        Ok(url)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: DEFAULT_LISTEN.to_string(),
            config_url: None,
            config_url_file: DEFAULT_URL_FILE.to_string(),
            config_base: DEFAULT_CONFIG_BASE.to_string(),
            min_poll_minutes: 5,
            max_poll_minutes: 15,
            fetch_timeout_secs: 30,
            read_timeout_secs: 10,
            write_timeout_secs: 10,
            dial_timeout_secs: 5,
            handshake_timeout_secs: 10,
            trust_mode: TrustMode::default(),
            selection: SelectionMode::default(),
            wait_for_config: true,
            log_level: Some("info".to_string()),
        }
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let url = url::Url::parse(raw)
        .map_err(|e| Error::config(format!("Invalid config URL {}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::config(format!(
            "Unsupported config URL scheme: {}",
            other
        ))),
    }
}
