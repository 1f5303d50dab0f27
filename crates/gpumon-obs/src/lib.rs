//! Pipeline observer: Prometheus counters and gauges behind an explicit handle

use gpumon_common::{Batch, GpumonError, Result};
use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::info;

pub mod exporter;

pub use exporter::{router, serve};

/// Created once at startup, cloned into the scheduler and exporter, flushed at shutdown.
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    ticks: IntCounter,
    ticks_abandoned: IntCounter,
    ticks_failed: IntCounter,
    measurements: IntCounter,
    parse_rejections: IntCounterVec,
    batches_written: IntCounter,
    batches_dropped: IntCounter,
    write_attempts: IntCounter,
    last_value: GaugeVec,
}

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub ticks_abandoned: u64,
    pub ticks_failed: u64,
    pub measurements: u64,
    pub parse_rejections: u64,
    pub batches_written: u64,
    pub batches_dropped: u64,
    pub write_attempts: u64,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::new(name, help).map_err(obs_error)?;
    registry.register(Box::new(c.clone())).map_err(obs_error)?;
    Ok(c)
}

fn obs_error(e: prometheus::Error) -> GpumonError {
    GpumonError::Config(format!("metrics registry: {e}"))
}

impl PipelineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("gpumon".into()), None).map_err(obs_error)?;
        let parse_rejections =
            IntCounterVec::new(Opts::new("parse_rejections_total", "Raw lines rejected by the parser"), &["reason"])
                .map_err(obs_error)?;
        registry.register(Box::new(parse_rejections.clone())).map_err(obs_error)?;
        let last_value =
            GaugeVec::new(Opts::new("gpu_value", "Last sampled value per gpu and field"), &["gpu", "field"])
                .map_err(obs_error)?;
        registry.register(Box::new(last_value.clone())).map_err(obs_error)?;

        Ok(Self {
            ticks: counter(&registry, "ticks_total", "Scheduler ticks started")?,
            ticks_abandoned: counter(&registry, "ticks_abandoned_total", "Ticks abandoned after the tick timeout")?,
            ticks_failed: counter(&registry, "ticks_failed_total", "Ticks skipped after a non-fatal read error")?,
            measurements: counter(&registry, "measurements_total", "Measurements handed to the sink")?,
            batches_written: counter(&registry, "batches_written_total", "Batches written to the store")?,
            batches_dropped: counter(&registry, "batches_dropped_total", "Batches dropped after failed writes")?,
            write_attempts: counter(&registry, "write_attempts_total", "Write calls issued to the store")?,
            parse_rejections,
            last_value,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn tick(&self) {
        self.ticks.inc();
    }

    pub fn tick_abandoned(&self) {
        self.ticks_abandoned.inc();
    }

    pub fn tick_failed(&self) {
        self.ticks_failed.inc();
    }

    pub fn parse_rejected(&self, reason: &str) {
        self.parse_rejections.with_label_values(&[reason]).inc();
    }

    /// Counts the batch and updates the per-gpu gauges.
    pub fn observe_batch(&self, batch: &Batch) {
        self.measurements.inc_by(batch.len() as u64);
        for m in batch.measurements() {
            let gpu = m.device_id().to_string();
            for (field, value) in m.present() {
                self.last_value.with_label_values(&[gpu.as_str(), field.key()]).set(value);
            }
        }
    }

    pub fn batch_written(&self, attempts: u32) {
        self.batches_written.inc();
        self.write_attempts.inc_by(u64::from(attempts));
    }

    pub fn batch_dropped(&self, attempts: u32) {
        self.batches_dropped.inc();
        self.write_attempts.inc_by(u64::from(attempts));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let rejections = self
            .registry
            .gather()
            .iter()
            .filter(|f| f.get_name().ends_with("parse_rejections_total"))
            .flat_map(|f| f.get_metric().iter().map(|m| m.get_counter().get_value() as u64).collect::<Vec<_>>())
            .sum();
        MetricsSnapshot {
            ticks: self.ticks.get(),
            ticks_abandoned: self.ticks_abandoned.get(),
            ticks_failed: self.ticks_failed.get(),
            measurements: self.measurements.get(),
            parse_rejections: rejections,
            batches_written: self.batches_written.get(),
            batches_dropped: self.batches_dropped.get(),
            write_attempts: self.write_attempts.get(),
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer).map_err(obs_error)?;
        String::from_utf8(buffer).map_err(|e| GpumonError::Config(format!("metrics encoding: {e}")))
    }

    /// Logs the final counter summary.
    pub fn flush(&self) -> MetricsSnapshot {
        let s = self.snapshot();
        info!(
            target: "obs",
            "ticks={} abandoned={} failed={} measurements={} rejected={} written={} dropped={} attempts={}",
            s.ticks, s.ticks_abandoned, s.ticks_failed, s.measurements, s.parse_rejections, s.batches_written, s.batches_dropped, s.write_attempts
        );
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use gpumon_common::{Field, Measurement};

    #[test]
    fn counters_and_gauges_follow_the_pipeline() {
        let metrics = PipelineMetrics::new().unwrap();
        let ts = NaiveDate::from_ymd_opt(2023, 4, 1).and_then(|d| d.and_hms_opt(10, 0, 0)).unwrap().and_utc();
        let batch = Batch::new(1, vec![Measurement::new(ts, 2).with_value(Field::Temperature, Some(45.0))]);

        metrics.tick();
        metrics.parse_rejected("too_short");
        metrics.parse_rejected("comment");
        metrics.observe_batch(&batch);
        metrics.batch_dropped(5);

        let s = metrics.flush();
        assert_eq!(s.ticks, 1);
        assert_eq!(s.parse_rejections, 2);
        assert_eq!(s.measurements, 1);
        assert_eq!(s.batches_dropped, 1);
        assert_eq!(s.write_attempts, 5);

        let text = metrics.render().unwrap();
        assert!(text.contains("gpumon_gpu_value{field=\"temp\",gpu=\"2\"} 45"));
        assert!(text.contains("gpumon_parse_rejections_total{reason=\"too_short\"} 1"));
    }

    #[test]
    fn handles_are_independent() {
        let a = PipelineMetrics::new().unwrap();
        let b = PipelineMetrics::new().unwrap();
        a.tick();
        assert_eq!(b.snapshot().ticks, 0);
    }
}
