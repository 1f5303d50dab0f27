//! Store points and their line-protocol form

use std::collections::BTreeMap;

use gpumon_common::{GpumonError, Measurement, Result, TagSet};

const MEASUREMENT_SPECIAL: &[char] = &[',', ' '];
const KEY_SPECIAL: &[char] = &[',', '=', ' '];

/// One point: measurement name, tags, float fields and a time in epoch seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: TagSet,
    fields: BTreeMap<String, f64>,
    time: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, tags: TagSet, time: i64) -> Self {
        Self { measurement: measurement.into(), tags, fields: BTreeMap::new(), time }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// `None` when the measurement has no present field.
    pub fn from_measurement(series: &str, tags: &TagSet, m: &Measurement) -> Option<Self> {
        if m.is_empty() {
            return None;
        }
        let mut tags = tags.clone().with("gpu", m.device_id().to_string());
        if let Some(name) = m.device_name() {
            tags = tags.with("name", name);
        }
        let point = m
            .present()
            .fold(Point::new(series, tags, m.timestamp().timestamp()), |p, (field, value)| p.with_field(field.key(), value));
        Some(point)
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn field(&self, key: &str) -> Option<f64> {
        self.fields.get(key).copied()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, f64)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    /// `measurement,tag=v field=1.5 1680343200`; empty tag values are left out.
    pub fn to_line(&self) -> String {
        let mut line = escape(&self.measurement, MEASUREMENT_SPECIAL);
        for (key, value) in self.tags.iter().filter(|(_, v)| !v.is_empty()) {
            line.push(',');
            line.push_str(&escape(key, KEY_SPECIAL));
            line.push('=');
            line.push_str(&escape(value, KEY_SPECIAL));
        }
        line.push(' ');
        let fields: Vec<String> =
            self.fields.iter().map(|(k, v)| format!("{}={}", escape(k, KEY_SPECIAL), v)).collect();
        line.push_str(&fields.join(","));
        line.push(' ');
        line.push_str(&self.time.to_string());
        line
    }

    /// Reads back a line written by [`Point::to_line`].
    pub fn from_line(line: &str) -> Result<Self> {
        let bad = |what: &str| GpumonError::ParseRejected(format!("{what} in line `{line}`"));
        let sections = split_unescaped(line.trim(), ' ');
        let [head, fields, time] = sections.as_slice() else {
            return Err(bad("expected three sections"));
        };

        let mut head = split_unescaped(head, ',').into_iter();
        let measurement = head.next().map(unescape).filter(|m| !m.is_empty()).ok_or_else(|| bad("missing measurement"))?;
        let mut tags = TagSet::default();
        for pair in head {
            let &[key, value] = split_unescaped(pair, '=').as_slice() else {
                return Err(bad("malformed tag"));
            };
            tags = tags.with(unescape(key), unescape(value));
        }

        let time = time.parse::<i64>().map_err(|_| bad("bad timestamp"))?;
        let mut point = Point::new(measurement, tags, time);
        for pair in split_unescaped(fields, ',') {
            let &[key, value] = split_unescaped(pair, '=').as_slice() else {
                return Err(bad("malformed field"));
            };
            let value = value.strip_suffix('i').unwrap_or(value).parse::<f64>().map_err(|_| bad("non-numeric field"))?;
            point = point.with_field(unescape(key), value);
        }
        if point.fields.is_empty() {
            return Err(bad("no fields"));
        }
        Ok(point)
    }
}

fn escape(text: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(&next) = chars.peek() {
                if KEY_SPECIAL.contains(&next) {
                    continue;
                }
            }
        }
        out.push(ch);
    }
    out
}

fn split_unescaped(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if escaped {
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == sep {
            parts.push(&text[start..i]);
            start = i + ch.len_utf8();
        }
    }
    parts.push(&text[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate, TimeZone, Utc};
    use gpumon_common::Field;

    fn sample() -> Measurement {
        let ts = NaiveDate::from_ymd_opt(2023, 4, 1).and_then(|d| d.and_hms_opt(10, 0, 0)).unwrap().and_utc();
        Measurement::new(ts, 0)
            .with_value(Field::Power, Some(30.0))
            .with_value(Field::Temperature, Some(45.0))
            .with_value(Field::SmUtil, Some(10.0))
            .with_value(Field::MemUtil, Some(5.0))
    }

    #[test]
    fn measurement_becomes_tagged_point() {
        let tags = TagSet::from_pairs(["host=node1", "cluster=kerb01"]).unwrap();
        let p = Point::from_measurement("gpu_measurements", &tags, &sample().with_device_name("Tesla T4")).unwrap();
        assert_eq!(p.measurement(), "gpu_measurements");
        assert_eq!(p.tags().get("gpu"), Some("0"));
        assert_eq!(p.tags().get("name"), Some("Tesla T4"));
        assert_eq!(p.tags().get("host"), Some("node1"));
        assert_eq!(p.field("pwr"), Some(30.0));
        assert_eq!(p.field("enc"), None);
        assert_eq!(p.time(), 1680343200);
    }

    #[test]
    fn repeated_wall_clock_hour_keeps_distinct_times() {
        let wall = NaiveDate::from_ymd_opt(2023, 11, 5).and_then(|d| d.and_hms_opt(1, 30, 0)).unwrap();
        let times: Vec<i64> = [4, 5]
            .into_iter()
            .map(|hours| FixedOffset::west_opt(hours * 3600).unwrap().from_local_datetime(&wall).unwrap().with_timezone(&Utc))
            .map(|at| Point::from_measurement("s", &TagSet::default(), &Measurement::new(at, 0).with_value(Field::Power, Some(1.0))))
            .map(|p| p.unwrap().time())
            .collect();
        assert_eq!(times, vec![1699162200, 1699165800]);
    }

    #[test]
    fn empty_measurement_has_no_point() {
        let m = Measurement::new(sample().timestamp(), 3);
        assert!(Point::from_measurement("s", &TagSet::default(), &m).is_none());
    }

    #[test]
    fn line_protocol_escapes_and_skips_empty_tags() {
        let tags = TagSet::default().with("rack id", "a,b").with("empty", "").with("k=v", "x");
        let p = Point::new("gpu stats,v2", tags, 1680343200).with_field("sm util", 10.0).with_field("pwr", 30.5);
        assert_eq!(p.to_line(), r"gpu\ stats\,v2,k\=v=x,rack\ id=a\,b pwr=30.5,sm\ util=10 1680343200");
    }

    #[test]
    fn line_reads_back_tags_and_fields() {
        let tags = TagSet::from_pairs(["host=node 1", "cluster=kerb01"]).unwrap();
        let p = Point::from_measurement("gpu_measurements", &tags, &sample()).unwrap();
        let back = Point::from_line(&p.to_line()).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        for line in ["", "m", "m f=1", "m f=x 1", "m,t f=1 1", "m f=1 now"] {
            assert!(Point::from_line(line).is_err(), "{line}");
        }
    }
}
