//! Harness configuration
//!
//! TOML-based configuration for the harness itself: where the broker
//! binary lives, where the fixture and certificate directories are,
//! and the timing budgets for startup, shutdown, and probing. Layered
//! the usual way: defaults < file < `CONFORMQ__*` environment
//! overrides, with `${VAR}` / `${VAR:-default}` substitution inside
//! the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root harness configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker-under-test configuration
    pub broker: BrokerSection,
    /// Probe configuration
    pub probe: ProbeSection,
    /// Test data locations
    pub paths: PathsSection,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

/// Broker-under-test configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    /// Path to the broker binary
    pub binary: PathBuf,
    /// Host the broker's listeners bind on
    pub host: String,
    /// Total budget for the readiness poll
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    /// Backoff between readiness probes
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// SIGTERM grace period before force-kill
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("mosquitto"),
            host: "localhost".to_string(),
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Probe configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    /// Default probe timeout, overridable per scenario
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
        }
    }
}

/// Test data locations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// Directory holding broker configuration fixtures
    pub fixtures: PathBuf,
    /// Directory holding certificates and keys
    pub ssl: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            fixtures: PathBuf::from("testdata/fixtures"),
            ssl: PathBuf::from("testdata/ssl"),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file with environment variable
    /// overrides.
    ///
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax
    /// 2. Override via env vars with the `CONFORMQ__` prefix and
    ///    double underscores for nesting, e.g.
    ///    `CONFORMQ__BROKER__BINARY=/usr/sbin/mosquitto`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "warn")?
            .set_default("broker.binary", "mosquitto")?
            .set_default("broker.host", "localhost")?
            .set_default("broker.startup_timeout", "10s")?
            .set_default("broker.poll_interval", "50ms")?
            .set_default("broker.grace_period", "5s")?
            .set_default("probe.timeout", "20s")?
            .set_default("paths.fixtures", "testdata/fixtures")?
            .set_default("paths.ssl", "testdata/ssl")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("CONFORMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: HarnessConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.binary.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "broker.binary must not be empty".to_string(),
            ));
        }
        if self.broker.host.is_empty() {
            return Err(ConfigError::Validation(
                "broker.host must not be empty".to_string(),
            ));
        }
        if self.broker.startup_timeout < self.broker.poll_interval {
            return Err(ConfigError::Validation(
                "broker.startup_timeout must be at least broker.poll_interval".to_string(),
            ));
        }
        if self.probe.timeout.is_zero() {
            return Err(ConfigError::Validation(
                "probe.timeout must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}
