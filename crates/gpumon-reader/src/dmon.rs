//! Streaming mode: one long-lived `nvidia-smi dmon` child

use std::time::Duration;

use async_trait::async_trait;
use gpumon_common::{GpumonError, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt as _;
use tracing::{debug, info, warn};

use crate::{DeviceReader, RawBatch, ToolCommand};

/// Lines buffered between the child and the scheduler. A full buffer stops
/// the worker reading, which in turn blocks the child on its pipe.
pub const LINE_CHANNEL_CAPACITY: usize = 256;

const DEFAULT_SETTLE: Duration = Duration::from_millis(50);

pub struct DmonReader {
    tool: ToolCommand,
    line_wait: Duration,
    settle: Duration,
    child: Option<Child>,
    lines: Option<mpsc::Receiver<String>>,
    worker: Option<JoinHandle<()>>,
}

impl DmonReader {
    pub fn new(smi_path: impl Into<std::path::PathBuf>, interval_secs: u64, line_wait: Duration) -> Self {
        let interval = interval_secs.max(1).to_string();
        Self::with_command(ToolCommand::new(smi_path, ["dmon", "-d", interval.as_str(), "-o", "DT"]), line_wait)
    }

    pub fn with_command(tool: ToolCommand, line_wait: Duration) -> Self {
        Self { tool, line_wait, settle: DEFAULT_SETTLE, child: None, lines: None, worker: None }
    }

    /// How long to keep collecting after the first line of a poll.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

#[async_trait]
impl DeviceReader for DmonReader {
    fn name(&self) -> &'static str {
        "dmon"
    }

    async fn open(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let mut child = self
            .tool
            .command()
            .spawn()
            .map_err(|e| GpumonError::DeviceUnavailable(format!("cannot start {}: {e}", self.tool.display())))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GpumonError::DeviceUnavailable("child stdout was not captured".into()))?;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let worker = tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stdout).lines());
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "reader", "dmon output read failed: {e}");
                        break;
                    }
                }
            }
            debug!(target: "reader", "dmon output closed");
        });

        info!(target: "reader", "started {} (pid {:?})", self.tool.display(), child.id());
        self.child = Some(child);
        self.lines = Some(rx);
        self.worker = Some(worker);
        Ok(())
    }

    /// Waits at most `line_wait` for output so the caller can observe a stop
    /// request; an empty batch means nothing arrived in time.
    async fn poll_once(&mut self) -> Result<RawBatch> {
        let rx = self
            .lines
            .as_mut()
            .ok_or_else(|| GpumonError::DeviceUnavailable("dmon reader is not open".into()))?;

        let mut batch = Vec::new();
        match timeout(self.line_wait, rx.recv()).await {
            Err(_) => return Ok(RawBatch::Lines(batch)),
            Ok(None) => return Err(GpumonError::DeviceUnavailable("dmon exited".into())),
            Ok(Some(line)) => batch.push(line),
        }
        while batch.len() < LINE_CHANNEL_CAPACITY {
            match timeout(self.settle, rx.recv()).await {
                Ok(Some(line)) => batch.push(line),
                // Closed: hand over what arrived; the next poll reports the exit.
                Ok(None) | Err(_) => break,
            }
        }
        Ok(RawBatch::Lines(batch))
    }

    async fn close(&mut self) {
        self.lines = None;
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(target: "reader", "dmon already exited: {e}");
            }
            info!(target: "reader", "stopped {}", self.tool.display());
        }
    }
}
