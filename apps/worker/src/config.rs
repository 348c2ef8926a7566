use std::{env, fmt, fs, path, time::Duration};

use serde::{Deserialize, Serialize};
use streams::{DEFAULT_APPEND_CHUNK_SIZE, RedisSettings};
use thiserror::Error;
use timeseries::ClickHouseSettings;

use crate::monitoring::ProbeSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    ReadFailed {
        path: path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    ParseFailed {
        path: path::PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worker: Worker,
    pub redis: Redis,
    pub clickhouse: ClickHouse,
    pub tuning: Tuning,
}

/// Process identity, fixed for the lifetime of the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Worker {
    pub region_id: Option<String>,
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Redis {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub stream_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouse {
    pub url: Option<String>,
    pub username: String,
    pub password: Option<String>,
    pub database: String,
    pub table: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub append_chunk_size: usize,
    pub read_count: usize,
    pub read_block_ms: u64,
    pub idle_delay_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_max_redirects: usize,
    /// Pending entries idle this long are reclaimed, 0 disables reclaiming.
    pub reclaim_idle_ms: u64,
}

/// Resolved identity of a running worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub region_id: String,
    pub worker_id: String,
}

impl Default for Redis {
    fn default() -> Self {
        Self { host: None, port: 6379, username: None, password: None, stream_name: None }
    }
}

impl Default for ClickHouse {
    fn default() -> Self {
        Self {
            url: None,
            username: "default".into(),
            password: None,
            database: "default".into(),
            table: None,
        }
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            append_chunk_size: DEFAULT_APPEND_CHUNK_SIZE,
            read_count: 5,
            read_block_ms: 1_000,
            idle_delay_ms: 1_000,
            probe_timeout_ms: 10_000,
            probe_max_redirects: 5,
            reclaim_idle_ms: 60_000,
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid { name, value })
}

fn redact(value: &Option<String>) -> &str {
    match value {
        Some(_) => "<redacted>",
        None => "<unset>",
    }
}

fn or_unset(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("<unset>")
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Worker configuration:")?;
        write_title_1(f, "Identity")?;
        write_1(f, "Region", &or_unset(&self.worker.region_id))?;
        write_1(f, "Worker", &or_unset(&self.worker.worker_id))?;
        write_title_1(f, "Redis")?;
        write_1(f, "Host", &or_unset(&self.redis.host))?;
        write_1(f, "Port", &self.redis.port)?;
        write_1(f, "Username", &or_unset(&self.redis.username))?;
        write_1(f, "Password", &redact(&self.redis.password))?;
        write_1(f, "Stream", &or_unset(&self.redis.stream_name))?;
        write_title_1(f, "ClickHouse")?;
        write_1(f, "URL", &or_unset(&self.clickhouse.url))?;
        write_1(f, "Username", &self.clickhouse.username)?;
        write_1(f, "Password", &redact(&self.clickhouse.password))?;
        write_1(f, "Database", &self.clickhouse.database)?;
        write_1(f, "Table", &or_unset(&self.clickhouse.table))?;
        write_title_1(f, "Tuning")?;
        write_1(f, "Append chunk size", &self.tuning.append_chunk_size)?;
        write_1(f, "Read count", &self.tuning.read_count)?;
        write_1(f, "Read block (ms)", &self.tuning.read_block_ms)?;
        write_1(f, "Idle delay (ms)", &self.tuning.idle_delay_ms)?;
        write_1(f, "Probe timeout (ms)", &self.tuning.probe_timeout_ms)?;
        write_1(f, "Probe max redirects", &self.tuning.probe_max_redirects)?;
        write_1(f, "Reclaim idle (ms)", &self.tuning.reclaim_idle_ms)?;

        Ok(())
    }
}

impl Config {
    /// Load the optional TOML file, then apply environment overrides.
    ///
    /// ```rust
    /// let cfg = config::Config::load(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn load(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let mut config = match optional_path {
            Some(path) => Self::from_file(path.as_ref())?,
            None => Self::default(),
        };
        config.apply_env(|name| env::var(name).ok())?;
        Ok(config)
    }

    /// Read a config file, which must exist.
    pub fn from_file(path: &path::Path) -> Result<Self, ConfigError> {
        let path = normalize_toml_path(path);
        let raw_string = fs::read_to_string(&path)
            .map_err(|source| ConfigError::ReadFailed { path: path.clone(), source })?;
        toml::from_str(&raw_string).map_err(|source| ConfigError::ParseFailed { path, source })
    }

    /// Override file values with whatever `lookup` returns for the
    /// deployment's environment variable names.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |name: &str| non_empty(lookup(name));

        let strings: [(&str, &mut Option<String>); 9] = [
            ("REGION_ID", &mut self.worker.region_id),
            ("WORKER_ID", &mut self.worker.worker_id),
            ("REDIS_HOST", &mut self.redis.host),
            ("REDIS_USERNAME", &mut self.redis.username),
            ("REDIS_PASSWORD", &mut self.redis.password),
            ("STREAM_NAME", &mut self.redis.stream_name),
            ("CLICKHOUSE_URL", &mut self.clickhouse.url),
            ("CLICKHOUSE_PASSWORD", &mut self.clickhouse.password),
            ("CLICKHOUSE_METRICS_TABLE", &mut self.clickhouse.table),
        ];
        for (name, slot) in strings {
            if let Some(value) = get(name) {
                *slot = Some(value);
            }
        }

        if let Some(value) = get("CLICKHOUSE_USERNAME") {
            self.clickhouse.username = value;
        }
        if let Some(value) = get("CLICKHOUSE_DATABASE") {
            self.clickhouse.database = value;
        }
        if let Some(value) = get("REDIS_PORT") {
            self.redis.port = parse("REDIS_PORT", value)?;
        }

        let tuning = &mut self.tuning;
        if let Some(value) = get("APPEND_CHUNK_SIZE") {
            tuning.append_chunk_size = parse("APPEND_CHUNK_SIZE", value)?;
        }
        if let Some(value) = get("READ_COUNT") {
            tuning.read_count = parse("READ_COUNT", value)?;
        }
        if let Some(value) = get("READ_BLOCK_MS") {
            tuning.read_block_ms = parse("READ_BLOCK_MS", value)?;
        }
        if let Some(value) = get("IDLE_DELAY_MS") {
            tuning.idle_delay_ms = parse("IDLE_DELAY_MS", value)?;
        }
        if let Some(value) = get("PROBE_TIMEOUT_MS") {
            tuning.probe_timeout_ms = parse("PROBE_TIMEOUT_MS", value)?;
        }
        if let Some(value) = get("PROBE_MAX_REDIRECTS") {
            tuning.probe_max_redirects = parse("PROBE_MAX_REDIRECTS", value)?;
        }
        if let Some(value) = get("RECLAIM_IDLE_MS") {
            tuning.reclaim_idle_ms = parse("RECLAIM_IDLE_MS", value)?;
        }

        Ok(())
    }

    pub fn identity(&self) -> Result<Identity, ConfigError> {
        let region_id = non_empty(self.worker.region_id.clone()).ok_or(ConfigError::Missing("REGION_ID"))?;
        let worker_id = non_empty(self.worker.worker_id.clone()).ok_or(ConfigError::Missing("WORKER_ID"))?;
        Ok(Identity { region_id, worker_id })
    }

    /// Redis connection settings and the stream name.
    pub fn log_settings(&self) -> Result<(RedisSettings, String), ConfigError> {
        let host = non_empty(self.redis.host.clone()).ok_or(ConfigError::Missing("REDIS_HOST"))?;
        let stream =
            non_empty(self.redis.stream_name.clone()).ok_or(ConfigError::Missing("STREAM_NAME"))?;

        let settings = RedisSettings {
            host,
            port: self.redis.port,
            username: non_empty(self.redis.username.clone()),
            password: non_empty(self.redis.password.clone()),
        };
        Ok((settings, stream))
    }

    pub fn clickhouse_settings(&self) -> Result<ClickHouseSettings, ConfigError> {
        let url =
            non_empty(self.clickhouse.url.clone()).ok_or(ConfigError::Missing("CLICKHOUSE_URL"))?;
        let table = non_empty(self.clickhouse.table.clone())
            .ok_or(ConfigError::Missing("CLICKHOUSE_METRICS_TABLE"))?;

        Ok(ClickHouseSettings {
            url,
            username: self.clickhouse.username.clone(),
            password: non_empty(self.clickhouse.password.clone()),
            database: self.clickhouse.database.clone(),
            table,
        })
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            timeout: Duration::from_millis(self.tuning.probe_timeout_ms),
            max_redirects: self.tuning.probe_max_redirects,
        }
    }
}
