//! Recording mode: `nvidia-smi dmon -f <file>` until stopped, for `parse_log` later

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use gpumon_common::{GpumonError, Result, StopSignal};
use tracing::{debug, info};

use crate::ToolCommand;

pub struct DmonRecorder {
    tool: ToolCommand,
    file: PathBuf,
}

impl DmonRecorder {
    pub fn new(smi_path: impl Into<PathBuf>, interval_secs: u64, file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let interval = interval_secs.max(1).to_string();
        let mut args: Vec<OsString> = vec!["dmon".into(), "-d".into(), interval.into(), "-o".into(), "DT".into(), "-f".into()];
        args.push(file.clone().into_os_string());
        Self { tool: ToolCommand { program: smi_path.into(), args }, file }
    }

    /// `file` is where `tool` is expected to write; it is only used for reporting.
    pub fn with_command(tool: ToolCommand, file: impl Into<PathBuf>) -> Self {
        Self { tool, file: file.into() }
    }

    pub fn tool(&self) -> &ToolCommand {
        &self.tool
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Runs the tool until `stop` fires, then kills it. A tool that exits on
    /// its own with a failure status is `DeviceUnavailable`.
    pub async fn record(&self, stop: &StopSignal) -> Result<()> {
        let mut cmd = self.tool.command();
        cmd.stdout(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| GpumonError::DeviceUnavailable(format!("cannot start {}: {e}", self.tool.display())))?;
        info!(target: "reader", "recording dmon output to {} (pid {:?})", self.file.display(), child.id());

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    return Err(GpumonError::DeviceUnavailable(format!("{} exited with {status}", self.tool.display())));
                }
                info!(target: "reader", "{} finished; log in {}", self.tool.display(), self.file.display());
            }
            _ = stop.stopped() => {
                if let Err(e) = child.kill().await {
                    debug!(target: "reader", "recorder already exited: {e}");
                }
                info!(target: "reader", "stopped recording to {}", self.file.display());
            }
        }
        Ok(())
    }
}
