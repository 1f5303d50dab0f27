//! Scripted reader for tests and dry runs

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gpumon_common::{Field, GpumonError, Result};

use crate::probe::{sample_device, FieldProbe};
use crate::{DeviceReader, RawBatch};

#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    name: Option<String>,
    values: BTreeMap<Field, f64>,
    failing: BTreeMap<Field, String>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device reporting a plausible value for every field.
    pub fn healthy() -> Self {
        Field::ALL.into_iter().enumerate().fold(Self::new(), |d, (i, f)| d.value(f, 10.0 + i as f64))
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn value(mut self, field: Field, value: f64) -> Self {
        self.values.insert(field, value);
        self
    }

    pub fn failing(mut self, field: Field, reason: &str) -> Self {
        self.failing.insert(field, reason.to_string());
        self
    }
}

impl FieldProbe for MockDevice {
    fn device_name(&self) -> Option<String> {
        self.name.clone()
    }

    fn read(&self, field: Field) -> std::result::Result<f64, String> {
        if let Some(reason) = self.failing.get(&field) {
            return Err(reason.clone());
        }
        self.values.get(&field).copied().ok_or_else(|| "NotSupported".to_string())
    }
}

/// Counters shared with the test after the reader moves into a scheduler.
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    opens: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MockStats {
    pub fn opens(&self) -> usize { self.opens.load(Ordering::SeqCst) }
    pub fn polls(&self) -> usize { self.polls.load(Ordering::SeqCst) }
    pub fn closes(&self) -> usize { self.closes.load(Ordering::SeqCst) }
}

pub struct MockReader {
    devices: Vec<MockDevice>,
    scripted_lines: VecDeque<Vec<String>>,
    fail_open: Option<String>,
    fatal_after: Option<usize>,
    delay: Option<Duration>,
    clock: DateTime<Utc>,
    stats: MockStats,
}

impl MockReader {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        let clock = NaiveDate::from_ymd_opt(2023, 4, 1)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .unwrap_or_default()
            .and_utc();
        Self { devices, scripted_lines: VecDeque::new(), fail_open: None, fatal_after: None, delay: None, clock, stats: MockStats::default() }
    }

    /// Each poll returns the next scripted batch of lines before falling back to devices.
    pub fn with_lines(mut self, batches: Vec<Vec<String>>) -> Self {
        self.scripted_lines = batches.into();
        self
    }

    pub fn failing_open(mut self, reason: &str) -> Self {
        self.fail_open = Some(reason.to_string());
        self
    }

    /// Polls after the first `polls` report the source as gone.
    pub fn fatal_after(mut self, polls: usize) -> Self {
        self.fatal_after = Some(polls);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn stats(&self) -> MockStats {
        self.stats.clone()
    }
}

#[async_trait]
impl DeviceReader for MockReader {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(&mut self) -> Result<()> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        match &self.fail_open {
            Some(reason) => Err(GpumonError::DeviceUnavailable(reason.clone())),
            None => Ok(()),
        }
    }

    async fn poll_once(&mut self) -> Result<RawBatch> {
        let n = self.stats.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fatal_after.is_some_and(|limit| n >= limit) {
            return Err(GpumonError::DeviceUnavailable("mock source gone".into()));
        }
        if let Some(lines) = self.scripted_lines.pop_front() {
            return Ok(RawBatch::Lines(lines));
        }
        let at = self.clock;
        self.clock += chrono::Duration::seconds(1);
        let records = self
            .devices
            .iter()
            .enumerate()
            .map(|(i, device)| sample_device(i as u32, device, &Field::ALL, at))
            .collect();
        Ok(RawBatch::Records(records))
    }

    async fn close(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}
