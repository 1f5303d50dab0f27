//! Structured mode: one `nvidia-smi -x -q` per tick

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpumon_common::{Field, GpumonError, Measurement, Result};
use roxmltree::{Document, Node, ParsingOptions};
use tracing::{debug, info};

use crate::{DeviceReader, RawBatch, ToolCommand};

pub struct SmiQueryReader {
    tool: ToolCommand,
    extended: bool,
}

impl SmiQueryReader {
    pub fn new(smi_path: impl Into<std::path::PathBuf>, extended: bool) -> Self {
        Self::with_command(ToolCommand::new(smi_path, ["-x", "-q"]), extended)
    }

    pub fn with_command(tool: ToolCommand, extended: bool) -> Self {
        Self { tool, extended }
    }

    async fn run_query(&self) -> Result<String> {
        let output = self
            .tool
            .command()
            .output()
            .await
            .map_err(|e| GpumonError::DeviceUnavailable(format!("cannot run {}: {e}", self.tool.display())))?;
        if !output.status.success() {
            return Err(GpumonError::ParseRejected(format!("{} exited with {}", self.tool.display(), output.status)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DeviceReader for SmiQueryReader {
    fn name(&self) -> &'static str {
        "query"
    }

    async fn open(&mut self) -> Result<()> {
        let xml = self.run_query().await.map_err(|e| match e {
            GpumonError::DeviceUnavailable(_) => e,
            other => GpumonError::DeviceUnavailable(other.to_string()),
        })?;
        let devices = parse_query_xml(&xml, self.extended, Utc::now())
            .map_err(|e| GpumonError::DeviceUnavailable(e.to_string()))?;
        info!(target: "reader", "structured query reader found {} gpu(s)", devices.len());
        Ok(())
    }

    async fn poll_once(&mut self) -> Result<RawBatch> {
        let xml = self.run_query().await?;
        let at = Utc::now();
        Ok(RawBatch::Records(parse_query_xml(&xml, self.extended, at)?))
    }

    async fn close(&mut self) {}
}

const BASE_FIELDS: [(Field, &[&str]); 2] = [
    (Field::Temperature, &["temperature", "gpu_temp"]),
    (Field::SmUtil, &["utilization", "gpu_util"]),
];

const EXTENDED_FIELDS: [(Field, &[&str]); 5] = [
    (Field::MemUtil, &["utilization", "memory_util"]),
    (Field::EncoderUtil, &["utilization", "encoder_util"]),
    (Field::DecoderUtil, &["utilization", "decoder_util"]),
    (Field::MemClock, &["clocks", "mem_clock"]),
    (Field::GraphicsClock, &["clocks", "graphics_clock"]),
];

/// Parses `nvidia-smi -x -q` output. Devices are numbered in document order.
pub fn parse_query_xml(xml: &str, extended: bool, at: DateTime<Utc>) -> Result<Vec<Measurement>> {
    let options = ParsingOptions { allow_dtd: true, ..ParsingOptions::default() };
    let doc = Document::parse_with_options(xml, options).map_err(|e| GpumonError::ParseRejected(format!("invalid query xml: {e}")))?;
    let root = doc.root_element();
    if !root.has_tag_name("nvidia_smi_log") {
        return Err(GpumonError::ParseRejected(format!("unexpected root element <{}>", root.tag_name().name())));
    }

    let gpus = root.children().filter(|n| n.is_element() && n.has_tag_name("gpu"));
    Ok(gpus.enumerate().map(|(index, gpu)| extract_gpu(index as u32, gpu, extended, at)).collect())
}

fn extract_gpu(device_id: u32, gpu: Node<'_, '_>, extended: bool, at: DateTime<Utc>) -> Measurement {
    let mut m = Measurement::new(at, device_id);
    if let Some(name) = text_at(gpu, &["product_name"]) {
        m = m.with_device_name(name);
    }

    let mut wanted: Vec<(Field, Option<f64>)> =
        BASE_FIELDS.iter().map(|(f, path)| (*f, text_at(gpu, path).and_then(leading_number))).collect();
    if extended {
        wanted.extend(EXTENDED_FIELDS.iter().map(|(f, path)| (*f, text_at(gpu, path).and_then(leading_number))));
        let power = text_at(gpu, &["power_readings", "power_draw"])
            .or_else(|| text_at(gpu, &["gpu_power_readings", "power_draw"]))
            .and_then(leading_number);
        wanted.push((Field::Power, power));
        wanted.push((Field::MemUsed, memory_used_pct(gpu)));
    }

    for (field, value) in wanted {
        if value.is_none() {
            debug!(target: "reader", "gpu {device_id}: {field} not reported");
        }
        m = m.with_value(field, value);
    }
    m
}

fn memory_used_pct(gpu: Node<'_, '_>) -> Option<f64> {
    let used = text_at(gpu, &["fb_memory_usage", "used"]).and_then(leading_number)?;
    let total = text_at(gpu, &["fb_memory_usage", "total"]).and_then(leading_number)?;
    (total > 0.0).then(|| used * 100.0 / total)
}

fn text_at<'a>(node: Node<'a, '_>, path: &[&str]) -> Option<&'a str> {
    let mut current = node;
    for name in path {
        current = current.children().find(|c| c.is_element() && c.has_tag_name(*name))?;
    }
    current.text().map(str::trim).filter(|t| !t.is_empty())
}

// "45 C", "30.12 W", "1200 MHz"; "N/A" yields None.
fn leading_number(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse::<f64>().ok().filter(|v| v.is_finite())
}
