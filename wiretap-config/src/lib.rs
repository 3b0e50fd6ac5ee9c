use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Wiretap configuration loaded from YAML.
///
/// This structure defines all configuration options for the proxy including
/// the operating mode, listen addresses, timeout settings, matcher tuning,
/// and the metrics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Operating mode: capture exchanges as mocks, or serve recorded mocks
    pub mode: Mode,
    /// List of addresses to listen on (e.g., "0.0.0.0:16789")
    pub listen_addrs: Vec<String>,
    /// Timeout configuration for various operations
    pub timeouts: Timeouts,
    /// Prometheus metrics configuration
    pub metrics: Metrics,
    /// Path of the mock file read in replay mode and written in record mode
    pub mock_file: PathBuf,
    /// Directory holding the root CA material (generated on first run)
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    /// On a replay miss, pass the request through to the origin instead of
    /// returning a protocol-level error (default: false)
    #[serde(default)]
    pub fallback_on_miss: bool,
    /// Enable the two-task pipelined HTTP/1.1 path (default: false)
    #[serde(default)]
    pub pipelining: bool,
    /// Header keys excluded from matching on both sides (noise map)
    #[serde(default)]
    pub header_noise: Vec<String>,
    /// Backdate for minted leaf certificates, keeps recorded tests valid
    /// under frozen clocks (RFC 3339)
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub backdate: Option<OffsetDateTime>,
    /// Maximum number of concurrent connections (default: 10000 if not specified)
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Graceful shutdown timeout in seconds (default: 30 if not specified)
    #[serde(default)]
    pub shutdown_timeout: Option<u64>,
}

/// Proxy operating mode. The two modes are mutually exclusive; one process
/// run is either recording or replaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Record,
    Replay,
}

/// Timeout settings for proxy operations (all values in seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to establish an origin connection (default: 10s)
    #[serde(default = "default_connect")]
    pub connect: u64,
    /// Maximum time to receive the TLS ClientHello (default: 10s)
    #[serde(default = "default_client_hello")]
    pub client_hello: u64,
    /// Read deadline for HTTP bodies, refreshed between reads (default: 20s)
    #[serde(default = "default_body_read")]
    pub body_read: u64,
    /// Read deadline while assembling chunked bodies (default: 5s)
    #[serde(default = "default_chunked_read")]
    pub chunked_read: u64,
    /// Opportunistic read deadline on the replay side (default: 1s)
    #[serde(default = "default_replay_read")]
    pub replay_read: u64,
    /// Maximum idle time for established connections (default: 300s)
    #[serde(default = "default_idle")]
    pub idle: u64,
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("wiretap-certs")
}

fn default_connect() -> u64 {
    10
}

fn default_client_hello() -> u64 {
    10
}

fn default_body_read() -> u64 {
    20
}

fn default_chunked_read() -> u64 {
    5
}

fn default_replay_read() -> u64 {
    1
}

fn default_idle() -> u64 {
    300
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            client_hello: default_client_hello(),
            body_read: default_body_read(),
            chunked_read: default_chunked_read(),
            replay_read: default_replay_read(),
            idle: default_idle(),
        }
    }
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (e.g., "127.0.0.1:9000")
    pub address: String,
}

impl Config {
    /// Loads configuration from a YAML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    ///
    /// Returns the parsed configuration or an error if the file cannot be read or parsed.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use wiretap_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config = serde_yaml_ng::from_str(&contents)?;
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// This is primarily used for testing and programmatic configuration.
    ///
    /// # Arguments
    ///
    /// * `contents` - YAML configuration as a string
    ///
    /// # Examples
    ///
    /// ```
    /// use wiretap_config::{Config, Mode};
    ///
    /// let yaml = r#"
    /// mode: replay
    /// listen_addrs:
    ///   - "127.0.0.1:16789"
    /// timeouts:
    ///   body_read: 20
    /// metrics:
    ///   enabled: false
    ///   address: "127.0.0.1:9000"
    /// mock_file: "mocks.yaml"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.mode, Mode::Replay);
    /// assert_eq!(config.listen_addrs[0], "127.0.0.1:16789");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config = serde_yaml_ng::from_str(contents)?;
        Ok(config)
    }
}

/// Checks whether a header key is matching noise.
///
/// Keys carrying the internal `wiretap-` prefix are always noise; the
/// configured noise list adds caller-specific keys. Comparison is
/// case-insensitive, as header keys are.
///
/// # Examples
///
/// ```
/// use wiretap_config::is_noise_header;
///
/// assert!(is_noise_header("wiretap-session-id", &[]));
/// assert!(is_noise_header("X-Request-Id", &["x-request-id".to_string()]));
/// assert!(!is_noise_header("content-type", &[]));
/// ```
pub fn is_noise_header(key: &str, noise: &[String]) -> bool {
    let lower = key.to_ascii_lowercase();
    if lower.starts_with("wiretap-") {
        return true;
    }
    noise.iter().any(|n| n.eq_ignore_ascii_case(&lower))
}
