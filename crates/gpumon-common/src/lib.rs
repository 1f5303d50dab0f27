//! Shared types for the GPU telemetry pipeline: errors, configuration, data model

pub mod config;
pub mod measurement;
pub mod retention;
pub mod shutdown;

pub use measurement::{local_instant, Batch, Field, Measurement, TagSet};
pub use shutdown::{stop_channel, StopSignal, StopTrigger};

pub type Result<T> = core::result::Result<T, GpumonError>;

#[derive(thiserror::Error, Debug)]
pub enum GpumonError {
    /// The polling source could not be started or initialized.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    /// One metric query failed for one device; the field is recorded absent.
    #[error("field {field} unsupported on gpu {device_id}: {reason}")]
    FieldUnsupported { device_id: u32, field: Field, reason: String },
    #[error("line rejected: {0}")]
    ParseRejected(String),
    /// The time-series store could not be reached or prepared at startup.
    #[error("metrics recording failed: {0}")]
    MetricsRecordingFailed(String),
    #[error("write failed: {reason}")]
    SinkWriteFailed { reason: String, retryable: bool },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GpumonError {
    /// Fatal errors stop the pipeline; everything else degrades in place.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GpumonError::DeviceUnavailable(_) | GpumonError::MetricsRecordingFailed(_) | GpumonError::Config(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, GpumonError::SinkWriteFailed { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_and_retryable() {
        assert!(GpumonError::DeviceUnavailable("nvml".into()).is_fatal());
        assert!(GpumonError::MetricsRecordingFailed("refused".into()).is_fatal());
        assert!(!GpumonError::ParseRejected("short".into()).is_fatal());

        let transient = GpumonError::SinkWriteFailed { reason: "503".into(), retryable: true };
        assert!(!transient.is_fatal());
        assert!(transient.is_retryable());
        let rejected = GpumonError::SinkWriteFailed { reason: "400".into(), retryable: false };
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn field_unsupported_names_field() {
        let err = GpumonError::FieldUnsupported { device_id: 2, field: Field::MemUtil, reason: "NotSupported".into() };
        assert_eq!(err.to_string(), "field mem unsupported on gpu 2: NotSupported");
    }
}
