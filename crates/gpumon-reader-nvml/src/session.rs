use gpumon_common::{Field, GpumonError, Result};
use gpumon_reader::{DeviceInfo, FieldProbe};
use nvml_wrapper::enum_wrappers::device::{Clock, TemperatureSensor};
use nvml_wrapper::{Device, Nvml};

/// An initialized NVML library handle; dropping it shuts the library down.
pub struct Session {
    nvml: Nvml,
    device_count: u32,
    driver_version: String,
}

impl Session {
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init().map_err(|e| GpumonError::DeviceUnavailable(format!("nvml init failed: {e}")))?;
        let device_count = nvml
            .device_count()
            .map_err(|e| GpumonError::DeviceUnavailable(format!("nvml device count failed: {e}")))?;
        let driver_version = nvml.sys_driver_version().unwrap_or_else(|_| "unknown".into());
        Ok(Self { nvml, device_count, driver_version })
    }

    pub fn driver_version(&self) -> &str {
        &self.driver_version
    }

    pub fn device_count(&self) -> u32 {
        self.device_count
    }

    pub fn probe(&self, index: u32) -> Result<Probe<'_>> {
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|e| GpumonError::DeviceUnavailable(format!("no handle for gpu {index}: {e}")))?;
        Ok(Probe { device })
    }

    pub fn describe(&self) -> Vec<DeviceInfo> {
        (0..self.device_count)
            .map(|index| DeviceInfo {
                index,
                name: self.nvml.device_by_index(index).and_then(|d| d.name()).ok(),
                driver_version: Some(self.driver_version.clone()),
            })
            .collect()
    }
}

pub struct Probe<'nvml> {
    device: Device<'nvml>,
}

impl FieldProbe for Probe<'_> {
    fn device_name(&self) -> Option<String> {
        self.device.name().ok()
    }

    fn read(&self, field: Field) -> std::result::Result<f64, String> {
        let d = &self.device;
        let value = match field {
            // milliwatts
            Field::Power => d.power_usage().map(|mw| f64::from(mw) / 1000.0),
            Field::Temperature => d.temperature(TemperatureSensor::Gpu).map(f64::from),
            Field::SmUtil => d.utilization_rates().map(|u| f64::from(u.gpu)),
            Field::MemUtil => d.utilization_rates().map(|u| f64::from(u.memory)),
            Field::EncoderUtil => d.encoder_utilization().map(|u| f64::from(u.utilization)),
            Field::DecoderUtil => d.decoder_utilization().map(|u| f64::from(u.utilization)),
            Field::MemClock => d.clock_info(Clock::Memory).map(f64::from),
            Field::GraphicsClock => d.clock_info(Clock::Graphics).map(f64::from),
            Field::MemUsed => {
                let info = d.memory_info().map_err(|e| e.to_string())?;
                if info.total == 0 {
                    return Err("total memory reported as zero".into());
                }
                return Ok(info.used as f64 * 100.0 / info.total as f64);
            }
        };
        value.map_err(|e| e.to_string())
    }
}
