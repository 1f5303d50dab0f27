//! Device readers: the polling-source side of the pipeline

use async_trait::async_trait;
use gpumon_common::{Measurement, Result};

pub mod dmon;
pub mod probe;
pub mod query;
pub mod record;
mod tool;

pub use dmon::DmonReader;
pub use probe::{sample_device, FieldProbe};
pub use query::{parse_query_xml, SmiQueryReader};
pub use record::DmonRecorder;
pub use tool::ToolCommand;

/// What one poll produced, before parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum RawBatch {
    /// Raw text lines from a streaming source; the record parser turns them into measurements.
    Lines(Vec<String>),
    /// Sources that already yield typed values per device.
    Records(Vec<Measurement>),
}

impl RawBatch {
    pub fn is_empty(&self) -> bool {
        match self {
            RawBatch::Lines(lines) => lines.is_empty(),
            RawBatch::Records(records) => records.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: Option<String>,
    pub driver_version: Option<String>,
}

/// A polling source owned exclusively by the scheduler loop.
///
/// `open` acquires the underlying tool or driver session and fails with
/// `DeviceUnavailable`; `close` releases it and is safe to call more than once.
#[async_trait]
pub trait DeviceReader: Send {
    fn name(&self) -> &'static str;
    async fn open(&mut self) -> Result<()>;
    async fn poll_once(&mut self) -> Result<RawBatch>;
    async fn close(&mut self);

    /// Lists visible devices. Readers that only stream text report nothing.
    async fn describe(&mut self) -> Result<Vec<DeviceInfo>> {
        Ok(match self.poll_once().await? {
            RawBatch::Records(records) => records
                .iter()
                .map(|m| DeviceInfo { index: m.device_id(), name: m.device_name().map(str::to_string), driver_version: None })
                .collect(),
            RawBatch::Lines(_) => Vec::new(),
        })
    }
}

#[cfg(feature = "mock")]
pub mod mock;
