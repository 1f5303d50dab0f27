use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::retention::RetentionDuration;
use crate::{GpumonError, Result, TagSet};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GpumonConfig {
    pub store: StoreConfig,
    pub sampler: SamplerConfig,
    pub reader: ReaderConfig,
    pub tags: TagSet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub series_name: String,
    pub ssl: bool,
    pub retention_policy: String,
    pub retention_duration: String,
    pub replication: u32,
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8086,
            username: String::new(),
            password: String::new(),
            database: "gpudata".into(),
            series_name: "gpu_measurements".into(),
            ssl: false,
            retention_policy: "standard".into(),
            retention_duration: "1d".into(),
            replication: 1,
            request_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retention(&self) -> Result<RetentionDuration> {
        RetentionDuration::parse(&self.retention_duration)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub polling_interval_ms: u64,
    pub tick_timeout_ms: u64,
    pub write_retries: u32,
    pub retry_pause_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { polling_interval_ms: 1_000, tick_timeout_ms: 5_000, write_retries: 5, retry_pause_ms: 5_000 }
    }
}

impl SamplerConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_timeout_ms)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderMode {
    /// One `nvidia-smi -x -q` invocation per tick.
    Query,
    /// A long-lived `nvidia-smi dmon` child, one line per device per interval.
    Dmon,
    /// Direct NVML queries per device and field.
    Nvml,
}

impl std::str::FromStr for ReaderMode {
    type Err = GpumonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "query" | "xml" => Ok(ReaderMode::Query),
            "dmon" | "stream" => Ok(ReaderMode::Dmon),
            "nvml" => Ok(ReaderMode::Nvml),
            other => Err(GpumonError::Config(format!("unknown reader mode `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub mode: ReaderMode,
    pub smi_path: PathBuf,
    /// Adds memory, power and clock fields to the structured query.
    pub extended: bool,
    pub dmon_interval_secs: u64,
    pub line_wait_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            mode: ReaderMode::Nvml,
            smi_path: PathBuf::from("nvidia-smi"),
            extended: true,
            dmon_interval_secs: 1,
            line_wait_ms: 1_000,
        }
    }
}

impl ReaderConfig {
    pub fn line_wait(&self) -> Duration {
        Duration::from_millis(self.line_wait_ms)
    }
}

impl GpumonConfig {
    /// `GPUMON_CONFIG` names a YAML file; otherwise defaults plus `GPUMON_*` overrides.
    pub fn load() -> Result<Self> {
        if let Ok(path) = env::var("GPUMON_CONFIG") {
            let text = std::fs::read_to_string(&path)?;
            return Self::from_yaml(&text);
        }
        let mut cfg = Self::default();
        cfg.apply_env(|key| env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| GpumonError::Config(e.to_string()))
    }

    /// Applies `GPUMON_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |key: &str| -> Result<Option<u64>> {
            match lookup(key) {
                Some(v) => v.trim().parse().map(Some).map_err(|_| GpumonError::Config(format!("{key}={v} is not a number"))),
                None => Ok(None),
            }
        };
        if let Some(v) = lookup("GPUMON_HOST") { self.store.host = v; }
        if let Some(v) = num("GPUMON_PORT")? { self.store.port = u16::try_from(v).map_err(|_| GpumonError::Config(format!("port {v} out of range")))?; }
        if let Some(v) = lookup("GPUMON_USERNAME") { self.store.username = v; }
        if let Some(v) = lookup("GPUMON_PASSWORD") { self.store.password = v; }
        if let Some(v) = lookup("GPUMON_DATABASE") { self.store.database = v; }
        if let Some(v) = lookup("GPUMON_SERIES_NAME") { self.store.series_name = v; }
        if let Some(v) = lookup("GPUMON_RETENTION_DURATION") { self.store.retention_duration = v; }
        if let Some(v) = num("GPUMON_POLLING_INTERVAL_MS")? { self.sampler.polling_interval_ms = v; }
        if let Some(v) = num("GPUMON_TICK_TIMEOUT_MS")? { self.sampler.tick_timeout_ms = v; }
        if let Some(v) = num("GPUMON_WRITE_RETRIES")? { self.sampler.write_retries = u32::try_from(v).map_err(|_| GpumonError::Config(format!("write retries {v} out of range")))?; }
        if let Some(v) = num("GPUMON_RETRY_PAUSE_MS")? { self.sampler.retry_pause_ms = v; }
        if let Some(v) = lookup("GPUMON_READER") { self.reader.mode = v.parse()?; }
        if let Some(v) = lookup("GPUMON_SMI_PATH") { self.reader.smi_path = PathBuf::from(v); }
        if let Some(v) = lookup("GPUMON_TAGS") {
            let extra = TagSet::from_pairs(v.split(',').filter(|p| !p.trim().is_empty()))?;
            self.tags.extend(&extra);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sampler.polling_interval_ms == 0 {
            return Err(GpumonError::Config("polling interval must be greater than zero".into()));
        }
        if self.sampler.tick_timeout_ms == 0 {
            return Err(GpumonError::Config("tick timeout must be greater than zero".into()));
        }
        if self.sampler.write_retries == 0 {
            return Err(GpumonError::Config("write retries must be at least 1".into()));
        }
        if self.store.database.trim().is_empty() || self.store.series_name.trim().is_empty() {
            return Err(GpumonError::Config("database and series name must not be empty".into()));
        }
        if self.store.replication == 0 {
            return Err(GpumonError::Config("replication factor must be at least 1".into()));
        }
        if self.reader.dmon_interval_secs == 0 {
            return Err(GpumonError::Config("dmon interval must be at least 1 second".into()));
        }
        self.store.retention()?;
        self.tags.validate()
    }
}
