use gpumon_common::{Field, GpumonError, Result};
use gpumon_reader::{DeviceInfo, FieldProbe};

/// Never constructed: `init` always fails in builds without NVML.
pub enum Session {}

pub enum Probe {}

impl Session {
    pub fn init() -> Result<Self> {
        Err(GpumonError::DeviceUnavailable("built without NVML support (enable the `nvidia` feature)".into()))
    }

    pub fn driver_version(&self) -> &str {
        match *self {}
    }

    pub fn device_count(&self) -> u32 {
        match *self {}
    }

    pub fn probe(&self, _index: u32) -> Result<Probe> {
        match *self {}
    }

    pub fn describe(&self) -> Vec<DeviceInfo> {
        match *self {}
    }
}

impl FieldProbe for Probe {
    fn read(&self, _field: Field) -> std::result::Result<f64, String> {
        match *self {}
    }
}
