//! Sampling scheduler: one loop owning the reader and the sink
//!
//! `Idle -> Running -> Cancelling -> Stopped`, or `Idle -> Stopped` when the
//! reader cannot be opened or stop came first. `run` consumes the scheduler.

use gpumon_common::config::SamplerConfig;
use gpumon_common::{stop_channel, Batch, Result, StopSignal, StopTrigger};
use gpumon_obs::PipelineMetrics;
use gpumon_reader::DeviceReader;
use gpumon_sink::{BatchSink, DeliveryOutcome};
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::pipeline::{parse_raw_batch, MonotonicGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Cancelling,
    Stopped,
}

#[derive(Debug, Clone)]
struct StateLog {
    current: SchedulerState,
    history: Vec<SchedulerState>,
}

/// Cloneable control surface for a scheduler that has been moved into `run`.
#[derive(Clone)]
pub struct SchedulerHandle {
    trigger: StopTrigger,
    state: watch::Receiver<StateLog>,
}

impl SchedulerHandle {
    /// Requests a cooperative stop. The in-flight tick finishes first.
    pub fn stop(&self) {
        self.trigger.stop();
    }

    pub fn signal(&self) -> StopSignal {
        self.trigger.signal()
    }

    pub fn state(&self) -> SchedulerState {
        self.state.borrow().current
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn transitions(&self) -> Vec<SchedulerState> {
        self.state.borrow().history.clone()
    }

    /// Waits until `state` is reached; `false` if the scheduler went away first.
    pub async fn wait_for(&self, state: SchedulerState) -> bool {
        let mut rx = self.state.clone();
        let ok = rx.wait_for(|log| log.current == state).await.is_ok();
        ok
    }
}

pub struct Scheduler<R, S> {
    pipeline: Pipeline<R, S>,
    trigger: StopTrigger,
    state: watch::Sender<StateLog>,
}

/// The parts a tick borrows mutably, kept apart from the published state.
struct Pipeline<R, S> {
    reader: R,
    sink: S,
    cfg: SamplerConfig,
    metrics: PipelineMetrics,
    stop: StopSignal,
    guard: MonotonicGuard,
}

fn enter(state: &watch::Sender<StateLog>, next: SchedulerState) {
    state.send_modify(|log| {
        log.current = next;
        log.history.push(next);
    });
    debug!(target: "scheduler", "state -> {next:?}");
}

impl<R: DeviceReader, S: BatchSink> Scheduler<R, S> {
    pub fn new(reader: R, sink: S, cfg: SamplerConfig, metrics: PipelineMetrics) -> Self {
        let (trigger, stop) = stop_channel();
        let (state, _) = watch::channel(StateLog { current: SchedulerState::Idle, history: vec![SchedulerState::Idle] });
        let pipeline = Pipeline { reader, sink, cfg, metrics, stop, guard: MonotonicGuard::default() };
        Self { pipeline, trigger, state }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle { trigger: self.trigger.clone(), state: self.state.subscribe() }
    }

    /// Runs until stopped or until the reader fails fatally. The reader is
    /// closed on every exit path once `open` has been attempted.
    ///
    /// Each tick fires one polling interval after the previous one. A stop
    /// that arrives mid-tick moves to `Cancelling` at once and lets the tick finish.
    pub async fn run(self) -> Result<()> {
        let Self { mut pipeline, trigger: _trigger, state } = self;
        let stop = pipeline.stop.clone();
        if stop.is_stopped() {
            enter(&state, SchedulerState::Stopped);
            return Ok(());
        }
        if let Err(e) = pipeline.reader.open().await {
            pipeline.reader.close().await;
            enter(&state, SchedulerState::Stopped);
            return Err(e);
        }
        enter(&state, SchedulerState::Running);
        let period = pipeline.cfg.polling_interval();
        info!(
            target: "scheduler",
            "sampling {} every {:?} (tick timeout {:?})",
            pipeline.reader.name(),
            period,
            pipeline.cfg.tick_timeout()
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick: u64 = 0;
        let mut cancelling = false;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break Ok(()),
                _ = ticker.tick() => {}
            }
            tick += 1;
            let pass = pipeline.run_tick(tick);
            tokio::pin!(pass);
            let result = tokio::select! {
                biased;
                result = &mut pass => result,
                _ = stop.stopped() => {
                    enter(&state, SchedulerState::Cancelling);
                    cancelling = true;
                    pass.await
                }
            };
            if let Err(e) = result {
                break Err(e);
            }
        };

        if outcome.is_ok() && !cancelling {
            enter(&state, SchedulerState::Cancelling);
        }
        pipeline.reader.close().await;
        enter(&state, SchedulerState::Stopped);
        info!(target: "scheduler", "stopped after {tick} tick(s)");
        outcome
    }
}

impl<R: DeviceReader, S: BatchSink> Pipeline<R, S> {
    /// One read, parse and deliver pass. Only a fatal reader error is returned.
    async fn run_tick(&mut self, tick: u64) -> Result<()> {
        self.metrics.tick();
        let raw = match timeout(self.cfg.tick_timeout(), self.reader.poll_once()).await {
            Err(_) => {
                warn!(target: "scheduler", "tick {tick}: read abandoned after {:?}", self.cfg.tick_timeout());
                self.metrics.tick_abandoned();
                return Ok(());
            }
            Ok(Err(e)) if e.is_fatal() => return Err(e),
            Ok(Err(e)) => {
                warn!(target: "scheduler", "tick {tick}: read failed: {e}");
                self.metrics.tick_failed();
                return Ok(());
            }
            Ok(Ok(raw)) => raw,
        };

        let parsed = parse_raw_batch(raw);
        for rejected in &parsed.rejected {
            self.metrics.parse_rejected(rejected.reason.reason());
        }
        let batch = Batch::new(tick, self.guard.admit(parsed.measurements));
        if batch.is_empty() {
            debug!(target: "scheduler", "tick {tick}: nothing to deliver");
            return Ok(());
        }

        self.metrics.observe_batch(&batch);
        match self.sink.deliver(&batch, &self.stop).await {
            DeliveryOutcome::Written { attempts } => self.metrics.batch_written(attempts),
            DeliveryOutcome::Dropped { attempts, .. } => self.metrics.batch_dropped(attempts),
            DeliveryOutcome::Empty => {}
        }
        Ok(())
    }
}
