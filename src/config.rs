//! Settings file (`config.toml`) and default correction

use crate::error::ConfigError;
use crate::proxy::aggregator::DEFAULT_MIN_SPEED_MBPS;
use crate::proxy::checker::{
    CheckerConfig, DEFAULT_ECHO_URL, DEFAULT_SPEED_TEST_MIN_BYTES, DEFAULT_SPEED_TEST_URL,
};
use crate::proxy::dispatcher::{DEFAULT_CONCURRENCY, MAX_CONCURRENCY};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_CHECK_TIMEOUT_SECS: i64 = 10;

/// Whole settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

/// `[settings]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Directory scanned for `*.txt` proxy lists
    #[serde(default = "default_fdip_dir")]
    pub fdip_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Reachability timeout in seconds
    #[serde(default = "default_check_timeout")]
    pub check_timeout: i64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: i64,
    #[serde(default = "default_speed_test_url")]
    pub speed_test_url: String,
    #[serde(default = "default_echo_url")]
    pub echo_url: String,
    /// Throughput a proxy must exceed to be kept, in MB/s
    #[serde(default = "default_min_speed_mbps")]
    pub min_speed_mbps: f64,
    #[serde(default = "default_speed_test_min_bytes")]
    pub speed_test_min_bytes: u64,
    #[serde(default = "default_geoip_db")]
    pub geoip_db: PathBuf,
    /// Proxies tried, in order, to reach the Telegram API
    #[serde(default)]
    pub preset_proxy: Vec<String>,
}

fn default_fdip_dir() -> PathBuf {
    PathBuf::from("FDIP")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_check_timeout() -> i64 {
    DEFAULT_CHECK_TIMEOUT_SECS
}

fn default_max_concurrent() -> i64 {
    DEFAULT_CONCURRENCY as i64
}

fn default_speed_test_url() -> String {
    DEFAULT_SPEED_TEST_URL.to_string()
}

fn default_echo_url() -> String {
    DEFAULT_ECHO_URL.to_string()
}

fn default_min_speed_mbps() -> f64 {
    DEFAULT_MIN_SPEED_MBPS
}

fn default_speed_test_min_bytes() -> u64 {
    DEFAULT_SPEED_TEST_MIN_BYTES
}

fn default_geoip_db() -> PathBuf {
    PathBuf::from("GeoLite2-Country.mmdb")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fdip_dir: default_fdip_dir(),
            output_dir: default_output_dir(),
            check_timeout: default_check_timeout(),
            max_concurrent: default_max_concurrent(),
            speed_test_url: default_speed_test_url(),
            echo_url: default_echo_url(),
            min_speed_mbps: default_min_speed_mbps(),
            speed_test_min_bytes: default_speed_test_min_bytes(),
            geoip_db: default_geoip_db(),
            preset_proxy: Vec::new(),
        }
    }
}

impl Settings {
    /// Reachability timeout; only meaningful after [`Config::normalize`]
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout.max(1) as u64)
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrent.clamp(1, MAX_CONCURRENCY as i64) as usize
    }

    pub fn checker_config(&self) -> CheckerConfig {
        CheckerConfig::new()
            .with_timeout(self.check_timeout())
            .with_echo_url(self.echo_url.clone())
            .with_speed_test_url(self.speed_test_url.clone())
            .with_speed_test_min_bytes(self.speed_test_min_bytes)
    }
}

/// `[telegram]` table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.trim().is_empty() && !self.chat_id.trim().is_empty()
    }
}

/// A setting that was missing or out of range and got replaced
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDefaultApplied {
    pub field: &'static str,
    pub found: String,
    pub applied: String,
}

impl fmt::Display for ConfigDefaultApplied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} = {:?} is not usable, using {:?}",
            self.field, self.found, self.applied
        )
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Read `path`, or fall back to defaults when it does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Replace unusable values with their defaults and report each change
    pub fn normalize(&mut self) -> Vec<ConfigDefaultApplied> {
        let settings = &mut self.settings;
        let mut applied = Vec::new();

        if settings.check_timeout <= 0 {
            applied.push(ConfigDefaultApplied {
                field: "check_timeout",
                found: settings.check_timeout.to_string(),
                applied: DEFAULT_CHECK_TIMEOUT_SECS.to_string(),
            });
            settings.check_timeout = DEFAULT_CHECK_TIMEOUT_SECS;
        }

        if settings.max_concurrent <= 0 {
            applied.push(ConfigDefaultApplied {
                field: "max_concurrent",
                found: settings.max_concurrent.to_string(),
                applied: DEFAULT_CONCURRENCY.to_string(),
            });
            settings.max_concurrent = DEFAULT_CONCURRENCY as i64;
        } else if settings.max_concurrent > MAX_CONCURRENCY as i64 {
            applied.push(ConfigDefaultApplied {
                field: "max_concurrent",
                found: settings.max_concurrent.to_string(),
                applied: MAX_CONCURRENCY.to_string(),
            });
            settings.max_concurrent = MAX_CONCURRENCY as i64;
        }

        if let Some(fixed) = normalize_url(&settings.speed_test_url, DEFAULT_SPEED_TEST_URL) {
            applied.push(ConfigDefaultApplied {
                field: "speed_test_url",
                found: settings.speed_test_url.clone(),
                applied: fixed.clone(),
            });
            settings.speed_test_url = fixed;
        }

        if let Some(fixed) = normalize_url(&settings.echo_url, DEFAULT_ECHO_URL) {
            applied.push(ConfigDefaultApplied {
                field: "echo_url",
                found: settings.echo_url.clone(),
                applied: fixed.clone(),
            });
            settings.echo_url = fixed;
        }

        if !settings.min_speed_mbps.is_finite() || settings.min_speed_mbps < 0.0 {
            applied.push(ConfigDefaultApplied {
                field: "min_speed_mbps",
                found: settings.min_speed_mbps.to_string(),
                applied: DEFAULT_MIN_SPEED_MBPS.to_string(),
            });
            settings.min_speed_mbps = DEFAULT_MIN_SPEED_MBPS;
        }

        applied
    }
}

/// Empty URLs take the default; URLs without a scheme get `https://`
fn normalize_url(raw: &str, default: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(default.to_string());
    }
    if !trimmed.contains("://") {
        return Some(format!("https://{}", trimmed));
    }
    (trimmed != raw).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("proxy-sieve-{}-{}", uuid::Uuid::new_v4(), name))
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.settings.fdip_dir, PathBuf::from("FDIP"));
        assert_eq!(config.settings.check_timeout, 10);
        assert_eq!(config.settings.max_concurrent, 100);
        assert_eq!(config.settings.speed_test_url, DEFAULT_SPEED_TEST_URL);
        assert!(!config.telegram.is_configured());
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [settings]
            fdip_dir = "lists"
            max_concurrent = 8
            preset_proxy = ["socks5://127.0.0.1:1080"]

            [telegram]
            bot_token = "123:abc"
            chat_id = "42"
            "#,
        )
        .unwrap();

        assert_eq!(config.settings.fdip_dir, PathBuf::from("lists"));
        assert_eq!(config.settings.concurrency(), 8);
        assert_eq!(config.settings.check_timeout, 10);
        assert_eq!(config.settings.preset_proxy.len(), 1);
        assert!(config.telegram.is_configured());
    }

    #[test]
    fn test_normalize_floors_and_urls() {
        let mut config = Config::default();
        config.settings.check_timeout = 0;
        config.settings.max_concurrent = -3;
        config.settings.speed_test_url = "speed.example.com/100mb".to_string();
        config.settings.echo_url = String::new();

        let applied = config.normalize();
        let fields: Vec<&str> = applied.iter().map(|a| a.field).collect();
        assert_eq!(fields, vec!["check_timeout", "max_concurrent", "speed_test_url", "echo_url"]);

        assert_eq!(config.settings.check_timeout, 10);
        assert_eq!(config.settings.max_concurrent, 100);
        assert_eq!(config.settings.speed_test_url, "https://speed.example.com/100mb");
        assert_eq!(config.settings.echo_url, DEFAULT_ECHO_URL);
    }

    #[test]
    fn test_normalize_caps_concurrency() {
        let mut config = Config::default();
        config.settings.max_concurrent = i64::MAX;
        assert_eq!(config.settings.concurrency(), MAX_CONCURRENCY);

        let applied = config.normalize();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].field, "max_concurrent");
        assert_eq!(applied[0].applied, MAX_CONCURRENCY.to_string());
        assert_eq!(config.settings.max_concurrent, MAX_CONCURRENCY as i64);
        assert_eq!(config.settings.concurrency() * 2, 2 * MAX_CONCURRENCY);
    }

    #[test]
    fn test_normalize_keeps_valid_values() {
        let mut config = Config::default();
        assert!(config.normalize().is_empty());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_empty_speed_test_url_takes_default() {
        let mut config = Config::default();
        config.settings.speed_test_url = "  ".to_string();
        config.normalize();
        assert_eq!(config.settings.speed_test_url, DEFAULT_SPEED_TEST_URL);
    }

    #[test]
    fn test_checker_config_conversion() {
        let mut config = Config::default();
        config.settings.check_timeout = 7;
        let checker = config.settings.checker_config();
        assert_eq!(checker.timeout, Duration::from_secs(7));
        assert_eq!(checker.echo_url, DEFAULT_ECHO_URL);
        assert_eq!(checker.speed_test_min_bytes, DEFAULT_SPEED_TEST_MIN_BYTES);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let path = temp_path("config.toml");
        let mut config = Config::default();
        config.settings.max_concurrent = 12;
        config.telegram.chat_id = "99".to_string();

        config.save_to_file(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load(temp_path("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let path = temp_path("broken.toml");
        fs::write(&path, "[settings]\ncheck_timeout = \"soon\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
        fs::remove_file(&path).unwrap();
    }
}
