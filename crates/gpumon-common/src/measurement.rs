//! Measurement, Batch and TagSet

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::{GpumonError, Result};

/// Canonical telemetry fields. `key()` is the name written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    /// Board power draw in watts.
    Power,
    /// GPU core temperature in Celsius.
    Temperature,
    SmUtil,
    MemUtil,
    /// Framebuffer memory in use, percent of total.
    MemUsed,
    EncoderUtil,
    DecoderUtil,
    MemClock,
    GraphicsClock,
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::Power,
        Field::Temperature,
        Field::SmUtil,
        Field::MemUtil,
        Field::MemUsed,
        Field::EncoderUtil,
        Field::DecoderUtil,
        Field::MemClock,
        Field::GraphicsClock,
    ];

    /// Column order of `nvidia-smi dmon -o DT` after `date time gpu`.
    pub const DMON: [Field; 8] = [
        Field::Power,
        Field::Temperature,
        Field::SmUtil,
        Field::MemUtil,
        Field::EncoderUtil,
        Field::DecoderUtil,
        Field::MemClock,
        Field::GraphicsClock,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Field::Power => "pwr",
            Field::Temperature => "temp",
            Field::SmUtil => "sm",
            Field::MemUtil => "mem",
            Field::MemUsed => "mem_used",
            Field::EncoderUtil => "enc",
            Field::DecoderUtil => "dec",
            Field::MemClock => "mclk",
            Field::GraphicsClock => "pclk",
        }
    }

    pub fn from_key(key: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.key() == key)
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Resolves a zone-less local wall-clock reading to an instant. An ambiguous
/// reading takes its first occurrence; one skipped by a DST jump is read as UTC.
pub fn local_instant(ts: NaiveDateTime) -> DateTime<Utc> {
    Local
        .from_local_datetime(&ts)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| ts.and_utc())
}

/// One observation of one device at one instant. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    timestamp: DateTime<Utc>,
    device_id: u32,
    device_name: Option<String>,
    values: [Option<f64>; 9],
}

impl Measurement {
    /// Starts an empty measurement; the timestamp is truncated to whole seconds.
    pub fn new(timestamp: DateTime<Utc>, device_id: u32) -> Self {
        let timestamp = timestamp.with_nanosecond(0).unwrap_or(timestamp);
        Self { timestamp, device_id, device_name: None, values: [None; 9] }
    }

    pub fn with_value(mut self, field: Field, value: Option<f64>) -> Self {
        self.values[field.slot()] = value.filter(|v| v.is_finite());
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.device_name = if name.trim().is_empty() { None } else { Some(name) };
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    pub fn get(&self, field: Field) -> Option<f64> {
        self.values[field.slot()]
    }

    /// Present fields in canonical order.
    pub fn present(&self) -> impl Iterator<Item = (Field, f64)> + '_ {
        Field::ALL.into_iter().filter_map(|f| self.get(f).map(|v| (f, v)))
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("timestamp", &self.timestamp.with_timezone(&Local).to_rfc3339_opts(SecondsFormat::Secs, false))?;
        map.serialize_entry("gpu", &self.device_id)?;
        if let Some(name) = &self.device_name {
            map.serialize_entry("name", name)?;
        }
        for field in Field::ALL {
            map.serialize_entry(field.key(), &self.get(field))?;
        }
        map.end()
    }
}

/// Measurements collected in one scheduler tick, one per active device.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    tick: u64,
    measurements: Vec<Measurement>,
}

impl Batch {
    pub fn new(tick: u64, measurements: Vec<Measurement>) -> Self {
        Self { tick, measurements }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

/// Tags attached to every point. Built once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Parses `key=value`; the value may itself contain `=`.
    pub fn parse_pair(pair: &str) -> Result<(String, String)> {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| GpumonError::Config(format!("tag `{pair}` is not key=value")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(GpumonError::Config(format!("tag `{pair}` has an empty key")));
        }
        Ok((key.to_string(), value.trim().to_string()))
    }

    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tags = BTreeMap::new();
        for pair in pairs {
            let (k, v) = Self::parse_pair(pair.as_ref())?;
            tags.insert(k, v);
        }
        Ok(Self(tags))
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Fills `key` only when it is not already set.
    pub fn with_default(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.entry(key.to_string()).or_insert_with(|| value.into());
        self
    }

    pub fn extend(&mut self, other: &TagSet) {
        for (k, v) in other.iter() {
            self.0.insert(k.to_string(), v.to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        match self.0.keys().find(|k| k.trim().is_empty()) {
            Some(_) => Err(GpumonError::Config("tag keys must not be empty".into())),
            None => Ok(()),
        }
    }
}
