//! Stages between a raw poll and the batch handed to the sink

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use gpumon_common::{Measurement, Result};
use gpumon_reader::RawBatch;
use tracing::debug;

use crate::parser::{parse_line, ParseRejection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub line: String,
    pub reason: ParseRejection,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBatch {
    pub measurements: Vec<Measurement>,
    pub rejected: Vec<Rejected>,
}

impl ParsedBatch {
    fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut parsed = ParsedBatch::default();
        for line in lines {
            match parse_line(line) {
                Ok(m) => parsed.measurements.push(m),
                Err(reason) => {
                    if !matches!(reason, ParseRejection::Blank | ParseRejection::Comment) {
                        debug!(target: "parser", "rejected `{line}`: {reason}");
                    }
                    parsed.rejected.push(Rejected { line: line.to_string(), reason });
                }
            }
        }
        parsed
    }
}

/// Stage one: raw poll output into measurements plus rejections.
pub fn parse_raw_batch(raw: RawBatch) -> ParsedBatch {
    match raw {
        RawBatch::Lines(lines) => ParsedBatch::from_lines(lines.iter().map(String::as_str)),
        RawBatch::Records(measurements) => ParsedBatch { measurements, rejected: Vec::new() },
    }
}

/// Stage two: keeps record instants non-decreasing per device across ticks.
#[derive(Debug, Default)]
pub struct MonotonicGuard {
    last: HashMap<u32, DateTime<Utc>>,
}

impl MonotonicGuard {
    pub fn admit(&mut self, measurements: Vec<Measurement>) -> Vec<Measurement> {
        measurements
            .into_iter()
            .filter(|m| match self.last.get(&m.device_id()) {
                Some(last) if m.timestamp() < *last => {
                    debug!(target: "parser", "gpu {}: dropping record at {} older than {}", m.device_id(), m.timestamp(), last);
                    false
                }
                _ => {
                    self.last.insert(m.device_id(), m.timestamp());
                    true
                }
            })
            .collect()
    }
}

/// Parses a saved `dmon` log file.
pub fn parse_log(path: impl AsRef<Path>) -> Result<ParsedBatch> {
    let text = std::fs::read_to_string(path.as_ref())?;
    Ok(ParsedBatch::from_lines(text.lines()))
}
