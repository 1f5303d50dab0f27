//! Batch delivery with a bounded, stop-aware retry loop

use std::time::Duration;

use async_trait::async_trait;
use gpumon_common::config::{SamplerConfig, StoreConfig};
use gpumon_common::{Batch, StopSignal, TagSet};
use tracing::{debug, warn};

use crate::{BatchSink, DeliveryOutcome, Point, PointStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first.
    pub attempts: u32,
    pub pause: Duration,
}

impl RetryPolicy {
    pub fn from_sampler(cfg: &SamplerConfig) -> Self {
        Self { attempts: cfg.write_retries, pause: cfg.retry_pause() }
    }
}

/// Where points go: database, optional retention policy and series name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub database: String,
    pub retention_policy: Option<String>,
    pub series: String,
}

impl WriteTarget {
    pub fn from_config(cfg: &StoreConfig) -> Self {
        Self {
            database: cfg.database.clone(),
            retention_policy: Some(cfg.retention_policy.clone()).filter(|rp| !rp.is_empty()),
            series: cfg.series_name.clone(),
        }
    }
}

pub struct SinkWriter<S> {
    store: S,
    target: WriteTarget,
    tags: TagSet,
    retry: RetryPolicy,
}

impl<S: PointStore> SinkWriter<S> {
    pub fn new(store: S, target: WriteTarget, tags: TagSet, retry: RetryPolicy) -> Self {
        Self { store, target, tags, retry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn points(&self, batch: &Batch) -> Vec<Point> {
        batch
            .measurements()
            .iter()
            .filter_map(|m| Point::from_measurement(&self.target.series, &self.tags, m))
            .collect()
    }
}

#[async_trait]
impl<S: PointStore> BatchSink for SinkWriter<S> {
    async fn deliver(&mut self, batch: &Batch, stop: &StopSignal) -> DeliveryOutcome {
        let points = self.points(batch);
        if points.is_empty() {
            return DeliveryOutcome::Empty;
        }
        let max_attempts = self.retry.attempts.max(1);
        let rp = self.target.retention_policy.as_deref();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.store.write_points(&self.target.database, rp, &points).await {
                Ok(()) => {
                    debug!(target: "sink", "tick {}: {} point(s) written on attempt {attempt}", batch.tick(), points.len());
                    return DeliveryOutcome::Written { attempts: attempt };
                }
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= max_attempts {
                warn!(target: "sink", "tick {}: dropping {} point(s) after {attempt} attempt(s): {err}", batch.tick(), points.len());
                return DeliveryOutcome::Dropped { attempts: attempt, reason: err.to_string() };
            }
            warn!(
                target: "sink",
                "tick {}: write attempt {attempt}/{max_attempts} failed: {err}; retrying in {:?}",
                batch.tick(),
                self.retry.pause
            );
            if stop.sleep_or_stop(self.retry.pause).await {
                warn!(target: "sink", "tick {}: stop requested, dropping batch", batch.tick());
                return DeliveryOutcome::Dropped { attempts: attempt, reason: "stop requested during retry pause".into() };
            }
        }
    }
}
