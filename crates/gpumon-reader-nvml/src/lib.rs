//! Driver-binding reader over NVML. Without the `nvidia` feature the crate
//! still builds and every `open` reports the device as unavailable.

use async_trait::async_trait;
use chrono::Utc;
use gpumon_common::{Field, GpumonError, Result};
use gpumon_reader::{sample_device, DeviceInfo, DeviceReader, RawBatch};
use tracing::{info, warn};

#[cfg(feature = "nvidia")]
mod session;

#[cfg(not(feature = "nvidia"))]
#[path = "unsupported.rs"]
mod session;

use session::Session;

pub struct NvmlReader {
    fields: Vec<Field>,
    session: Option<Session>,
}

impl Default for NvmlReader {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmlReader {
    pub fn new() -> Self {
        Self::with_fields(Field::ALL.to_vec())
    }

    pub fn with_fields(fields: Vec<Field>) -> Self {
        Self { fields, session: None }
    }

    pub fn is_supported() -> bool {
        cfg!(feature = "nvidia")
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or_else(|| GpumonError::DeviceUnavailable("nvml session is not open".into()))
    }
}

#[async_trait]
impl DeviceReader for NvmlReader {
    fn name(&self) -> &'static str {
        "nvml"
    }

    async fn open(&mut self) -> Result<()> {
        if self.session.is_none() {
            let session = Session::init()?;
            info!(target: "reader", "nvml driver {} with {} gpu(s)", session.driver_version(), session.device_count());
            self.session = Some(session);
        }
        Ok(())
    }

    async fn poll_once(&mut self) -> Result<RawBatch> {
        let session = self.session()?;
        let at = Utc::now();
        let mut records = Vec::with_capacity(session.device_count() as usize);
        for index in 0..session.device_count() {
            match session.probe(index) {
                Ok(probe) => records.push(sample_device(index, &probe, &self.fields, at)),
                Err(e) => warn!(target: "reader", "skipping gpu {index}: {e}"),
            }
        }
        Ok(RawBatch::Records(records))
    }

    async fn close(&mut self) {
        if self.session.take().is_some() {
            info!(target: "reader", "nvml session closed");
        }
    }

    async fn describe(&mut self) -> Result<Vec<DeviceInfo>> {
        Ok(self.session()?.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "nvidia"))]
    #[tokio::test]
    async fn open_without_driver_support_is_fatal() {
        let mut reader = NvmlReader::new();
        let err = reader.open().await.unwrap_err();
        assert!(matches!(err, GpumonError::DeviceUnavailable(_)));
        assert!(err.is_fatal());
        reader.close().await;
    }

    #[tokio::test]
    async fn poll_before_open_is_unavailable() {
        let mut reader = NvmlReader::with_fields(vec![Field::Temperature]);
        assert!(matches!(reader.poll_once().await, Err(GpumonError::DeviceUnavailable(_))));
        assert!(matches!(reader.describe().await, Err(GpumonError::DeviceUnavailable(_))));
    }
}
