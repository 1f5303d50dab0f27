use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gpumon_common::config::SamplerConfig;
use gpumon_common::{Batch, Field, GpumonError, Result, StopSignal, TagSet};
use gpumon_core::{Scheduler, SchedulerState};
use gpumon_obs::PipelineMetrics;
use gpumon_reader::mock::{MockDevice, MockReader};
use gpumon_sink::{BatchSink, DeliveryOutcome, Point, PointStore, RetentionPolicyInfo, RetentionSpec, RetryPolicy, SinkWriter, WriteTarget};
use tokio::time::{sleep, Instant};

use SchedulerState::*;

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<Batch>>>);

impl RecordingSink {
    fn batches(&self) -> Vec<Batch> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchSink for RecordingSink {
    async fn deliver(&mut self, batch: &Batch, _stop: &StopSignal) -> DeliveryOutcome {
        self.0.lock().unwrap().push(batch.clone());
        DeliveryOutcome::Written { attempts: 1 }
    }
}

fn sampler() -> SamplerConfig {
    SamplerConfig { polling_interval_ms: 1_000, tick_timeout_ms: 5_000, write_retries: 5, retry_pause_ms: 5_000 }
}

fn devices(n: usize) -> Vec<MockDevice> {
    (0..n).map(|_| MockDevice::healthy()).collect()
}

#[tokio::test(start_paused = true)]
async fn unavailable_device_never_runs() {
    let reader = MockReader::new(devices(2)).failing_open("nvml init failed");
    let stats = reader.stats();
    let sink = RecordingSink::default();
    let scheduler = Scheduler::new(reader, sink.clone(), sampler(), PipelineMetrics::new().unwrap());
    let handle = scheduler.handle();

    let err = scheduler.run().await.unwrap_err();
    assert!(matches!(err, GpumonError::DeviceUnavailable(_)));
    assert_eq!(handle.transitions(), vec![Idle, Stopped]);
    assert_eq!(stats.polls(), 0);
    assert_eq!(stats.closes(), 1);
    assert!(sink.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_before_start_goes_straight_to_stopped() {
    let reader = MockReader::new(devices(1));
    let stats = reader.stats();
    let scheduler = Scheduler::new(reader, RecordingSink::default(), sampler(), PipelineMetrics::new().unwrap());
    let handle = scheduler.handle();
    handle.stop();

    scheduler.run().await.unwrap();
    assert_eq!(handle.transitions(), vec![Idle, Stopped]);
    assert_eq!(stats.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn ticks_deliver_one_batch_each_until_stopped() {
    let reader = MockReader::new(devices(3));
    let stats = reader.stats();
    let sink = RecordingSink::default();
    let metrics = PipelineMetrics::new().unwrap();
    let scheduler = Scheduler::new(reader, sink.clone(), sampler(), metrics.clone());
    let handle = scheduler.handle();

    let running = tokio::spawn(scheduler.run());
    assert!(handle.wait_for(Running).await);
    sleep(Duration::from_millis(4_500)).await;
    handle.stop();
    running.await.unwrap().unwrap();

    assert_eq!(handle.state(), Stopped);
    assert_eq!(handle.transitions(), vec![Idle, Running, Cancelling, Stopped]);
    let batches = sink.batches();
    assert_eq!(batches.len(), 4);
    for (i, batch) in batches.iter().enumerate() {
        assert_eq!(batch.tick(), i as u64 + 1);
        assert_eq!(batch.len(), 3);
    }
    assert_eq!(stats.closes(), 1);
    assert_eq!(metrics.snapshot().batches_written, 4);
    assert_eq!(metrics.snapshot().measurements, 12);
}

#[tokio::test(start_paused = true)]
async fn one_failing_field_leaves_the_rest_of_the_batch() {
    let reader = MockReader::new(vec![
        MockDevice::healthy(),
        MockDevice::healthy(),
        MockDevice::healthy().failing(Field::MemUtil, "NotSupported"),
    ]);
    let sink = RecordingSink::default();
    let scheduler = Scheduler::new(reader, sink.clone(), sampler(), PipelineMetrics::new().unwrap());
    let handle = scheduler.handle();

    let running = tokio::spawn(scheduler.run());
    sleep(Duration::from_millis(1_500)).await;
    handle.stop();
    running.await.unwrap().unwrap();

    let batch = &sink.batches()[0];
    assert_eq!(batch.len(), 3);
    let m = batch.measurements();
    assert_eq!(m[2].get(Field::MemUtil), None);
    assert!(m[2].get(Field::SmUtil).is_some());
    for full in &m[..2] {
        assert_eq!(full.present().count(), Field::ALL.len());
    }
}

#[tokio::test(start_paused = true)]
async fn first_tick_waits_one_polling_interval() {
    let reader = MockReader::new(devices(1));
    let stats = reader.stats();
    let scheduler = Scheduler::new(reader, RecordingSink::default(), sampler(), PipelineMetrics::new().unwrap());
    let handle = scheduler.handle();

    let running = tokio::spawn(scheduler.run());
    assert!(handle.wait_for(Running).await);
    sleep(Duration::from_millis(900)).await;
    assert_eq!(stats.polls(), 0);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(stats.polls(), 1);
    handle.stop();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_during_a_slow_read_enters_cancelling_while_the_tick_finishes() {
    let reader = MockReader::new(devices(2)).with_delay(Duration::from_secs(3));
    let stats = reader.stats();
    let sink = RecordingSink::default();
    let scheduler = Scheduler::new(reader, sink.clone(), sampler(), PipelineMetrics::new().unwrap());
    let handle = scheduler.handle();

    let running = tokio::spawn(scheduler.run());
    assert!(handle.wait_for(Running).await);
    // The first read starts at 1s and takes until 4s.
    sleep(Duration::from_millis(1_500)).await;
    handle.stop();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), Cancelling);
    assert!(!running.is_finished());
    assert_eq!(stats.closes(), 0);

    running.await.unwrap().unwrap();
    assert_eq!(handle.transitions(), vec![Idle, Running, Cancelling, Stopped]);
    assert_eq!(stats.polls(), 1);
    assert_eq!(sink.batches().len(), 1);
    assert_eq!(stats.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_reads_are_abandoned_and_the_loop_continues() {
    let reader = MockReader::new(devices(1)).with_delay(Duration::from_secs(10));
    let stats = reader.stats();
    let sink = RecordingSink::default();
    let metrics = PipelineMetrics::new().unwrap();
    let scheduler = Scheduler::new(reader, sink.clone(), sampler(), metrics.clone());
    let handle = scheduler.handle();

    let running = tokio::spawn(scheduler.run());
    sleep(Duration::from_secs(12)).await;
    handle.stop();
    running.await.unwrap().unwrap();

    assert!(sink.batches().is_empty());
    assert!(stats.polls() >= 2, "polls: {}", stats.polls());
    assert_eq!(metrics.snapshot().ticks_abandoned as usize, stats.polls());
}

#[tokio::test(start_paused = true)]
async fn fatal_read_error_closes_the_reader() {
    let reader = MockReader::new(devices(2)).fatal_after(2);
    let stats = reader.stats();
    let sink = RecordingSink::default();
    let scheduler = Scheduler::new(reader, sink.clone(), sampler(), PipelineMetrics::new().unwrap());
    let handle = scheduler.handle();

    let err = scheduler.run().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(handle.transitions(), vec![Idle, Running, Stopped]);
    assert_eq!(sink.batches().len(), 2);
    assert_eq!(stats.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn streamed_lines_are_parsed_and_rejections_counted() {
    let lines = vec![
        "# gpu   pwr  gtemp".to_string(),
        "20230401 10:00:00 0 30 45 10 5 0 0 300 1200".to_string(),
        "20230401 10:00:00 1 31 46 -".to_string(),
    ];
    let reader = MockReader::new(Vec::new()).with_lines(vec![lines]);
    let sink = RecordingSink::default();
    let metrics = PipelineMetrics::new().unwrap();
    let scheduler = Scheduler::new(reader, sink.clone(), sampler(), metrics.clone());
    let handle = scheduler.handle();

    let running = tokio::spawn(scheduler.run());
    sleep(Duration::from_millis(1_500)).await;
    handle.stop();
    running.await.unwrap().unwrap();

    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].measurements()[0].get(Field::Power), Some(30.0));
    assert_eq!(metrics.snapshot().parse_rejections, 2);
}

struct DownStore;

#[async_trait]
impl PointStore for DownStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn create_database(&self, _name: &str) -> Result<()> {
        Ok(())
    }
    async fn list_retention_policies(&self, _database: &str) -> Result<Vec<RetentionPolicyInfo>> {
        Ok(Vec::new())
    }
    async fn create_retention_policy(&self, _database: &str, _policy: &RetentionSpec) -> Result<()> {
        Ok(())
    }
    async fn alter_retention_policy(&self, _database: &str, _policy: &RetentionSpec) -> Result<()> {
        Ok(())
    }
    async fn write_points(&self, _database: &str, _rp: Option<&str>, _points: &[Point]) -> Result<()> {
        Err(GpumonError::SinkWriteFailed { reason: "connection refused".into(), retryable: true })
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_does_not_wait_out_the_retry_schedule() {
    let cfg = sampler();
    let target = WriteTarget { database: "gpudata".into(), retention_policy: None, series: "gpu_measurements".into() };
    let sink = SinkWriter::new(DownStore, target, TagSet::default(), RetryPolicy::from_sampler(&cfg));
    let metrics = PipelineMetrics::new().unwrap();
    let scheduler = Scheduler::new(MockReader::new(devices(1)), sink, cfg.clone(), metrics.clone());
    let handle = scheduler.handle();

    let running = tokio::spawn(scheduler.run());
    sleep(Duration::from_secs(2)).await;
    let stop_requested = Instant::now();
    handle.stop();
    running.await.unwrap().unwrap();

    assert!(stop_requested.elapsed() < cfg.polling_interval() + cfg.tick_timeout());
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.batches_dropped, 1);
    assert_eq!(snapshot.write_attempts, 1);
}
