//! `nvidia-smi dmon -o DT` line parser
//!
//! Columns: `date time gpu pwr temp sm mem enc dec mclk pclk`.

use std::fmt;

use chrono::NaiveDateTime;
use gpumon_common::{local_instant, Field, GpumonError, Measurement};

/// `date time gpu` plus one column per [`Field::DMON`] entry.
pub const MIN_COLUMNS: usize = 3 + Field::DMON.len();

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseRejection {
    Blank,
    /// `#` header or comment line.
    Comment,
    TooShort { found: usize, expected: usize },
    BadTimestamp(String),
    BadDeviceId(String),
    BadNumber { column: &'static str, token: String },
}

impl ParseRejection {
    /// Stable label for counters.
    pub fn reason(&self) -> &'static str {
        match self {
            ParseRejection::Blank => "blank",
            ParseRejection::Comment => "comment",
            ParseRejection::TooShort { .. } => "too_short",
            ParseRejection::BadTimestamp(_) => "bad_timestamp",
            ParseRejection::BadDeviceId(_) => "bad_device_id",
            ParseRejection::BadNumber { .. } => "bad_number",
        }
    }
}

impl fmt::Display for ParseRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseRejection::Blank => f.write_str("blank line"),
            ParseRejection::Comment => f.write_str("comment line"),
            ParseRejection::TooShort { found, expected } => write!(f, "{found} columns, expected at least {expected}"),
            ParseRejection::BadTimestamp(ts) => write!(f, "bad timestamp `{ts}`"),
            ParseRejection::BadDeviceId(token) => write!(f, "bad gpu index `{token}`"),
            ParseRejection::BadNumber { column, token } => write!(f, "non-numeric {column} `{token}`"),
        }
    }
}

impl From<ParseRejection> for GpumonError {
    fn from(r: ParseRejection) -> Self {
        GpumonError::ParseRejected(r.to_string())
    }
}

/// Parses one line. Pure: the same line always gives the same result.
pub fn parse_line(line: &str) -> Result<Measurement, ParseRejection> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ParseRejection::Blank);
    }
    if trimmed.starts_with('#') {
        return Err(ParseRejection::Comment);
    }
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    if tokens.len() < MIN_COLUMNS {
        return Err(ParseRejection::TooShort { found: tokens.len(), expected: MIN_COLUMNS });
    }

    let stamp = format!("{} {}", tokens[0], tokens[1]);
    let timestamp =
        NaiveDateTime::parse_from_str(&stamp, "%Y%m%d %H:%M:%S").map_err(|_| ParseRejection::BadTimestamp(stamp.clone()))?;
    let device_id = tokens[2].parse::<u32>().map_err(|_| ParseRejection::BadDeviceId(tokens[2].to_string()))?;

    // dmon prints the host's wall clock without a zone.
    let mut m = Measurement::new(local_instant(timestamp), device_id);
    for (field, token) in Field::DMON.into_iter().zip(&tokens[3..]) {
        let value = number(token).ok_or_else(|| ParseRejection::BadNumber { column: field.key(), token: token.to_string() })?;
        m = m.with_value(field, Some(value));
    }
    Ok(m)
}

// Plain decimal only; `nan`, `inf`, exponents and `-` placeholders are refused.
fn number(token: &str) -> Option<f64> {
    let digits = token.strip_prefix('-').unwrap_or(token);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    token.parse::<f64>().ok()
}
