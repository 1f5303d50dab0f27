//! Retention-policy duration literals (`1h`, `90m`, `7d`, `24h0m0s`, `INF`)

use std::fmt;

use crate::{GpumonError, Result};

const HOUR: u64 = 3600;

/// A store duration literal, kept verbatim for statements and compared in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionDuration {
    literal: String,
    secs: Option<u64>,
}

impl RetentionDuration {
    /// Accepts `INF` or groups of `<int><unit>` with units `s m h d w`.
    /// Finite durations shorter than one hour are refused by the store, so they are refused here.
    pub fn parse(literal: &str) -> Result<Self> {
        let literal = literal.trim();
        let secs = parse_secs(literal)
            .ok_or_else(|| GpumonError::Config(format!("invalid retention duration `{literal}`")))?;
        if let Some(s) = secs {
            if s < HOUR {
                return Err(GpumonError::Config(format!("retention duration `{literal}` is shorter than 1h")));
            }
        }
        Ok(Self { literal: literal.to_string(), secs })
    }

    /// `None` is infinite retention.
    pub fn as_secs(&self) -> Option<u64> {
        self.secs
    }

    pub fn literal(&self) -> &str {
        &self.literal
    }

    /// Compares against a duration as reported by the store, e.g. `168h0m0s` or `0s`.
    pub fn matches_reported(&self, reported: &str) -> bool {
        match parse_secs(reported.trim()) {
            Some(Some(0)) | Some(None) => self.secs.is_none(),
            Some(other) => other == self.secs,
            None => false,
        }
    }
}

impl fmt::Display for RetentionDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.literal)
    }
}

// Outer None: malformed. Inner None: infinite.
fn parse_secs(text: &str) -> Option<Option<u64>> {
    if text.eq_ignore_ascii_case("inf") {
        return Some(None);
    }
    if text.is_empty() {
        return None;
    }
    let mut total: u64 = 0;
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => HOUR,
            'd' => 24 * HOUR,
            'w' => 7 * 24 * HOUR,
            _ => return None,
        };
        let n: u64 = digits.parse().ok()?;
        total = total.checked_add(n.checked_mul(unit)?)?;
        digits.clear();
    }
    if !digits.is_empty() {
        return None;
    }
    Some(Some(total))
}
