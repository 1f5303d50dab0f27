//! Per-field sampling where each query may fail on its own

use chrono::{DateTime, Utc};
use gpumon_common::{Field, GpumonError, Measurement};
use tracing::debug;

/// One device as seen through a driver binding.
pub trait FieldProbe {
    fn device_name(&self) -> Option<String> {
        None
    }

    fn read(&self, field: Field) -> Result<f64, String>;
}

/// Queries every requested field; a failed query leaves that field absent
/// instead of failing the whole sample.
pub fn sample_device(device_id: u32, probe: &dyn FieldProbe, fields: &[Field], at: DateTime<Utc>) -> Measurement {
    let mut measurement = Measurement::new(at, device_id);
    if let Some(name) = probe.device_name() {
        measurement = measurement.with_device_name(name);
    }
    for &field in fields {
        match probe.read(field) {
            Ok(value) => measurement = measurement.with_value(field, Some(value)),
            Err(reason) => {
                let err = GpumonError::FieldUnsupported { device_id, field, reason };
                debug!(target: "reader", "{err}");
            }
        }
    }
    measurement
}
