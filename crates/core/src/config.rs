use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PagetraceError, Result};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_TRANSACTION_DURATION: Duration = Duration::from_secs(600);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_SPANS: usize = 1000;
pub const DEFAULT_BUFFER_SIZE: usize = 30;
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);
pub const DEFAULT_TRACING_ORIGINS: [&str; 2] = ["localhost", "^/"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub endpoint: Option<String>,
    pub headers: Vec<(String, String)>,
    pub request_timeout: Duration,
    pub traces_sample_rate: Option<f64>,
    pub idle_timeout: Duration,
    pub max_transaction_duration: Duration,
    pub heartbeat_interval: Duration,
    pub max_spans: usize,
    pub transport_buffer_size: usize,
    pub default_retry_after: Duration,
    pub tracing_origins: Vec<String>,
    pub start_transaction_on_page_load: bool,
    pub start_transaction_on_location_change: bool,
    pub mark_background_transactions: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            headers: Vec::new(),
            request_timeout: Duration::from_secs(10),
            traces_sample_rate: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_transaction_duration: DEFAULT_MAX_TRANSACTION_DURATION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_spans: DEFAULT_MAX_SPANS,
            transport_buffer_size: DEFAULT_BUFFER_SIZE,
            default_retry_after: DEFAULT_RETRY_AFTER,
            tracing_origins: default_tracing_origins(),
            start_transaction_on_page_load: true,
            start_transaction_on_location_change: true,
            mark_background_transactions: true,
        }
    }
}

pub fn default_tracing_origins() -> Vec<String> {
    DEFAULT_TRACING_ORIGINS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        let config_path = config_file_path();
        if let Some(file_overrides) = load_file_overrides(&config_path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Replaces invalid values with their defaults, logging one warning per
    /// adjustment. Returns the adjusted option names.
    pub fn normalize(&mut self) -> Vec<&'static str> {
        let mut adjusted = Vec::new();

        if self.tracing_origins.iter().all(|o| o.trim().is_empty()) {
            warn!("tracing_origins is empty; falling back to default origins");
            self.tracing_origins = default_tracing_origins();
            adjusted.push("tracing_origins");
        }
        if let Some(rate) = self.traces_sample_rate
            && !(0.0..=1.0).contains(&rate)
        {
            warn!(rate, "traces_sample_rate must be between 0 and 1; sampling disabled");
            self.traces_sample_rate = None;
            adjusted.push("traces_sample_rate");
        }
        if self.transport_buffer_size == 0 {
            warn!("transport_buffer_size must be positive; using default");
            self.transport_buffer_size = DEFAULT_BUFFER_SIZE;
            adjusted.push("transport_buffer_size");
        }
        if self.max_spans == 0 {
            warn!("max_spans must be positive; using default");
            self.max_spans = DEFAULT_MAX_SPANS;
            adjusted.push("max_spans");
        }
        if self.idle_timeout.is_zero() {
            warn!("idle_timeout must be positive; using default");
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
            adjusted.push("idle_timeout");
        }
        if self.max_transaction_duration.is_zero() {
            warn!("max_transaction_duration must be positive; using default");
            self.max_transaction_duration = DEFAULT_MAX_TRANSACTION_DURATION;
            adjusted.push("max_transaction_duration");
        }
        if self.heartbeat_interval.is_zero() {
            warn!("heartbeat_interval must be positive; using default");
            self.heartbeat_interval = DEFAULT_HEARTBEAT_INTERVAL;
            adjusted.push("heartbeat_interval");
        }
        if self
            .endpoint
            .as_deref()
            .is_some_and(|e| e.trim().is_empty())
        {
            self.endpoint = None;
            adjusted.push("endpoint");
        }

        adjusted
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    endpoint: Option<String>,
    headers: Option<String>,
    request_timeout: Option<String>,
    traces_sample_rate: Option<f64>,
    idle_timeout: Option<String>,
    max_transaction_duration: Option<String>,
    heartbeat_interval: Option<String>,
    max_spans: Option<usize>,
    transport_buffer_size: Option<usize>,
    default_retry_after: Option<String>,
    tracing_origins: Option<Vec<String>>,
    start_transaction_on_page_load: Option<bool>,
    start_transaction_on_location_change: Option<bool>,
    mark_background_transactions: Option<bool>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("PAGETRACE_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("pagetrace/config.toml")
}

fn load_file_overrides(path: &Path) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path).map_err(|e| {
        PagetraceError::Config(format!("failed reading {}: {e}", path.display()))
    })?;
    let parsed: ConfigOverrides = toml::from_str(&raw).map_err(|e| {
        PagetraceError::Config(format!("failed parsing {}: {e}", path.display()))
    })?;
    Ok(Some(parsed))
}

fn env_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PagetraceError::Config(format!("bad {name} in environment: {e}"))),
        Err(_) => Ok(None),
    }
}

fn env_flag(name: &str) -> Result<Option<bool>> {
    match env::var(name) {
        Ok(v) => parse_flag(&v)
            .map(Some)
            .ok_or_else(|| PagetraceError::Config(format!("bad {name} in environment: {v}"))),
        Err(_) => Ok(None),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn load_env_overrides() -> Result<ConfigOverrides> {
    Ok(ConfigOverrides {
        endpoint: env::var("PAGETRACE_ENDPOINT").ok(),
        headers: env::var("PAGETRACE_HEADERS").ok(),
        request_timeout: env::var("PAGETRACE_REQUEST_TIMEOUT").ok(),
        traces_sample_rate: env_parsed("PAGETRACE_TRACES_SAMPLE_RATE")?,
        idle_timeout: env::var("PAGETRACE_IDLE_TIMEOUT").ok(),
        max_transaction_duration: env::var("PAGETRACE_MAX_TRANSACTION_DURATION").ok(),
        heartbeat_interval: env::var("PAGETRACE_HEARTBEAT_INTERVAL").ok(),
        max_spans: env_parsed("PAGETRACE_MAX_SPANS")?,
        transport_buffer_size: env_parsed("PAGETRACE_BUFFER_SIZE")?,
        default_retry_after: env::var("PAGETRACE_DEFAULT_RETRY_AFTER").ok(),
        tracing_origins: env::var("PAGETRACE_TRACING_ORIGINS")
            .ok()
            .map(|v| split_list(&v)),
        start_transaction_on_page_load: env_flag("PAGETRACE_START_ON_PAGE_LOAD")?,
        start_transaction_on_location_change: env_flag("PAGETRACE_START_ON_LOCATION_CHANGE")?,
        mark_background_transactions: env_flag("PAGETRACE_MARK_BACKGROUND_TRANSACTIONS")?,
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_duration_override(value: &str, key: &str, source: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        PagetraceError::Config(format!("bad {key} in {source}: {e} (value={value})"))
    })
}

fn apply_overrides(cfg: &mut Config, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.endpoint {
        cfg.endpoint = Some(v);
    }
    if let Some(v) = overrides.headers {
        cfg.headers = parse_headers(&v).map_err(|e| {
            PagetraceError::Config(format!("bad headers in {source}: {e} (value={v})"))
        })?;
    }
    if let Some(v) = overrides.request_timeout {
        cfg.request_timeout = parse_duration_override(&v, "request_timeout", source)?;
    }
    if let Some(v) = overrides.traces_sample_rate {
        cfg.traces_sample_rate = Some(v);
    }
    if let Some(v) = overrides.idle_timeout {
        cfg.idle_timeout = parse_duration_override(&v, "idle_timeout", source)?;
    }
    if let Some(v) = overrides.max_transaction_duration {
        cfg.max_transaction_duration =
            parse_duration_override(&v, "max_transaction_duration", source)?;
    }
    if let Some(v) = overrides.heartbeat_interval {
        cfg.heartbeat_interval = parse_duration_override(&v, "heartbeat_interval", source)?;
    }
    if let Some(v) = overrides.max_spans {
        cfg.max_spans = v;
    }
    if let Some(v) = overrides.transport_buffer_size {
        cfg.transport_buffer_size = v;
    }
    if let Some(v) = overrides.default_retry_after {
        cfg.default_retry_after = parse_duration_override(&v, "default_retry_after", source)?;
    }
    if let Some(v) = overrides.tracing_origins {
        cfg.tracing_origins = v;
    }
    if let Some(v) = overrides.start_transaction_on_page_load {
        cfg.start_transaction_on_page_load = v;
    }
    if let Some(v) = overrides.start_transaction_on_location_change {
        cfg.start_transaction_on_location_change = v;
    }
    if let Some(v) = overrides.mark_background_transactions {
        cfg.mark_background_transactions = v;
    }
    Ok(())
}

fn parse_headers(raw: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(PagetraceError::Config(
                "header entries must use key=value syntax".to_string(),
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(PagetraceError::Config("header key cannot be empty".to_string()));
        }
        out.push((key.to_string(), value.trim().to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_expected_timeouts() {
        let cfg = Config::default();
        assert_eq!(cfg.idle_timeout, Duration::from_millis(1000));
        assert_eq!(cfg.max_transaction_duration, Duration::from_secs(600));
        assert_eq!(cfg.default_retry_after, Duration::from_secs(60));
        assert_eq!(cfg.transport_buffer_size, 30);
        assert_eq!(cfg.traces_sample_rate, None);
    }

    #[test]
    fn default_tracing_origins_cover_localhost_and_relative() {
        let cfg = Config::default();
        assert_eq!(cfg.tracing_origins, vec!["localhost", "^/"]);
        assert!(cfg.start_transaction_on_page_load);
        assert!(cfg.start_transaction_on_location_change);
        assert!(cfg.mark_background_transactions);
    }

    #[test]
    fn parse_headers_accepts_list() {
        let headers = parse_headers("x-tenant=dev,authorization=Bearer token").unwrap();
        assert_eq!(
            headers,
            vec![
                ("x-tenant".to_string(), "dev".to_string()),
                ("authorization".to_string(), "Bearer token".to_string())
            ]
        );
    }

    #[test]
    fn parse_headers_rejects_bad_entries() {
        assert!(parse_headers("x-tenant").is_err());
        assert!(parse_headers("=dev").is_err());
    }

    #[test]
    fn normalize_restores_defaults_for_invalid_values() {
        let mut cfg = Config {
            tracing_origins: Vec::new(),
            traces_sample_rate: Some(1.5),
            transport_buffer_size: 0,
            endpoint: Some("  ".to_string()),
            ..Config::default()
        };

        let adjusted = cfg.normalize();

        assert_eq!(
            adjusted,
            vec![
                "tracing_origins",
                "traces_sample_rate",
                "transport_buffer_size",
                "endpoint"
            ]
        );
        assert_eq!(cfg.tracing_origins, default_tracing_origins());
        assert_eq!(cfg.traces_sample_rate, None);
        assert_eq!(cfg.transport_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(cfg.endpoint, None);
    }

    #[test]
    fn normalize_keeps_valid_values() {
        let mut cfg = Config {
            tracing_origins: vec!["api.example.com".to_string()],
            traces_sample_rate: Some(0.25),
            ..Config::default()
        };
        assert!(cfg.normalize().is_empty());
        assert_eq!(cfg.tracing_origins, vec!["api.example.com"]);
        assert_eq!(cfg.traces_sample_rate, Some(0.25));
    }

    #[test]
    fn normalize_rejects_nan_sample_rate() {
        let mut cfg = Config {
            traces_sample_rate: Some(f64::NAN),
            ..Config::default()
        };
        assert_eq!(cfg.normalize(), vec!["traces_sample_rate"]);
        assert_eq!(cfg.traces_sample_rate, None);
    }

    #[test]
    fn apply_file_overrides_updates_tracing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
endpoint = "http://127.0.0.1:9000/api/1/store/"
headers = "x-tenant=dev"
traces_sample_rate = 0.5
idle_timeout = "2s"
max_transaction_duration = "30s"
transport_buffer_size = 4
tracing_origins = ["api.example.com"]
mark_background_transactions = false
"#,
        )
        .unwrap();

        let mut cfg = Config::default();
        let file = load_file_overrides(&path).unwrap().unwrap();
        apply_overrides(&mut cfg, file, "config file").unwrap();

        assert_eq!(
            cfg.endpoint.as_deref(),
            Some("http://127.0.0.1:9000/api/1/store/")
        );
        assert_eq!(cfg.headers, vec![("x-tenant".to_string(), "dev".to_string())]);
        assert_eq!(cfg.traces_sample_rate, Some(0.5));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(2));
        assert_eq!(cfg.max_transaction_duration, Duration::from_secs(30));
        assert_eq!(cfg.transport_buffer_size, 4);
        assert_eq!(cfg.tracing_origins, vec!["api.example.com"]);
        assert!(!cfg.mark_background_transactions);
    }

    #[test]
    fn missing_config_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            load_file_overrides(&dir.path().join("absent.toml"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn bad_duration_override_names_the_key() {
        let mut cfg = Config::default();
        let overrides = ConfigOverrides {
            idle_timeout: Some("whenever".to_string()),
            ..ConfigOverrides::default()
        };
        let err = apply_overrides(&mut cfg, overrides, "environment").unwrap_err();
        assert!(err.to_string().contains("idle_timeout"));
    }

    #[test]
    fn parses_flags_and_lists() {
        assert_eq!(parse_flag("Yes"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
        assert_eq!(split_list("a, b,,c "), vec!["a", "b", "c"]);
    }
}
