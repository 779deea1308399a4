//! Configuration
//!
//! Loaded from an optional TOML file, then overridden from the environment.
//! Every field has a default so an empty file is a valid configuration.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration (bacscan.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacscanConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub scan: ScanDefaults,
    #[serde(default)]
    pub requests: RequestConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How to launch the proxy engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Engine executable (searched on PATH when relative)
    #[serde(default = "default_program")]
    pub program: PathBuf,
    /// Arguments; `{address}` is replaced with the bind address
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Address to bind to. Auto-detected from the outbound route when unset.
    pub local_address: Option<IpAddr>,
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: f64,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
}

fn default_program() -> PathBuf {
    PathBuf::from("bacnet-proxy")
}

fn default_args() -> Vec<String> {
    vec!["--address".to_string(), "{address}".to_string()]
}

fn default_registration_timeout() -> f64 {
    5.0
}

fn default_stop_grace() -> u64 {
    500
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            local_address: None,
            registration_timeout_secs: default_registration_timeout(),
            stop_grace_ms: default_stop_grace(),
        }
    }
}

/// Seconds as a `Duration` when the value is positive and representable
pub(crate) fn checked_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|duration| !duration.is_zero())
}

/// Saturating conversion for already-validated values
fn secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

impl ProxyConfig {
    pub fn registration_timeout(&self) -> Duration {
        secs(self.registration_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Arguments with the bind address substituted
    pub fn args_for(&self, address: IpAddr) -> Vec<String> {
        let address = address.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{address}", &address))
            .collect()
    }
}

/// Defaults applied to scan parameters the caller leaves unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanDefaults {
    #[serde(default = "default_whois_timeout")]
    pub whois_timeout_secs: f64,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub low_limit: u32,
    #[serde(default = "default_high_limit")]
    pub high_limit: u32,
    #[serde(default = "default_true")]
    pub enable_brute_force: bool,
    #[serde(default = "default_semaphore_limit")]
    pub semaphore_limit: usize,
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: f64,
}

fn default_whois_timeout() -> f64 {
    3.0
}

fn default_port() -> u16 {
    47808
}

fn default_high_limit() -> u32 {
    crate::discovery::MAX_DEVICE_INSTANCE
}

fn default_true() -> bool {
    true
}

fn default_semaphore_limit() -> usize {
    20
}

fn default_max_duration() -> f64 {
    280.0
}

impl Default for ScanDefaults {
    fn default() -> Self {
        Self {
            whois_timeout_secs: default_whois_timeout(),
            port: default_port(),
            low_limit: 0,
            high_limit: default_high_limit(),
            enable_brute_force: true,
            semaphore_limit: default_semaphore_limit(),
            max_duration_secs: default_max_duration(),
        }
    }
}

/// Timeouts for correlated requests other than scans
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_request_timeout")]
    pub default_timeout_secs: f64,
    #[serde(default = "default_object_list_timeout")]
    pub object_list_timeout_secs: f64,
    #[serde(default = "default_who_is_timeout")]
    pub who_is_timeout_secs: f64,
}

fn default_request_timeout() -> f64 {
    30.0
}

fn default_object_list_timeout() -> f64 {
    120.0
}

fn default_who_is_timeout() -> f64 {
    10.0
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_request_timeout(),
            object_list_timeout_secs: default_object_list_timeout(),
            who_is_timeout_secs: default_who_is_timeout(),
        }
    }
}

impl RequestConfig {
    pub fn default_timeout(&self) -> Duration {
        secs(self.default_timeout_secs)
    }

    pub fn object_list_timeout(&self) -> Duration {
        secs(self.object_list_timeout_secs)
    }

    pub fn who_is_timeout(&self) -> Duration {
        secs(self.who_is_timeout_secs)
    }
}

/// On-disk cache location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Defaults to `<user cache dir>/bacscan`
    pub dir: Option<PathBuf>,
}

impl CacheConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(crate::cache::CacheStore::default_dir)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_filter() -> String {
    "bacscan=info,proxy=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
        }
    }
}

/// Configuration errors. These are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl BacscanConfig {
    /// Load from `path` if given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply overrides:
    /// - `BACSCAN_PROXY_PROGRAM`: engine executable
    /// - `BACSCAN_LOCAL_ADDRESS`: bind address
    /// - `BACSCAN_CACHE_DIR`: cache directory
    /// - `BACSCAN_LOG`: log filter
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(program) = lookup("BACSCAN_PROXY_PROGRAM") {
            self.proxy.program = PathBuf::from(program);
        }
        if let Some(address) = lookup("BACSCAN_LOCAL_ADDRESS") {
            let parsed = address.parse().map_err(|_| ConfigError::Invalid {
                key: "BACSCAN_LOCAL_ADDRESS".into(),
                message: format!("'{}' is not an IP address", address),
            })?;
            self.proxy.local_address = Some(parsed);
        }
        if let Some(dir) = lookup("BACSCAN_CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if let Some(filter) = lookup("BACSCAN_LOG") {
            self.logging.filter = filter;
        }
        Ok(())
    }

    /// Reject values that would make timeouts or limits meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("proxy.registration_timeout_secs", self.proxy.registration_timeout_secs),
            ("scan.whois_timeout_secs", self.scan.whois_timeout_secs),
            ("scan.max_duration_secs", self.scan.max_duration_secs),
            ("requests.default_timeout_secs", self.requests.default_timeout_secs),
            ("requests.object_list_timeout_secs", self.requests.object_list_timeout_secs),
            ("requests.who_is_timeout_secs", self.requests.who_is_timeout_secs),
        ];
        for (key, value) in positive {
            if checked_secs(value).is_none() {
                return Err(ConfigError::Invalid {
                    key: key.into(),
                    message: format!("must be a positive, representable number of seconds, got {}", value),
                });
            }
        }
        if self.scan.semaphore_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "scan.semaphore_limit".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.scan.low_limit > self.scan.high_limit
            || self.scan.high_limit > crate::discovery::MAX_DEVICE_INSTANCE
        {
            return Err(ConfigError::Invalid {
                key: "scan.high_limit".into(),
                message: format!(
                    "instance range {}..={} is not within 0..={}",
                    self.scan.low_limit,
                    self.scan.high_limit,
                    crate::discovery::MAX_DEVICE_INSTANCE
                ),
            });
        }
        Ok(())
    }
}
