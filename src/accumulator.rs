//! This module contains the structure that accumulates log volume
//! per call site before it is read or exported.
//!
//! The accumulator pre-aggregates calls per (file, line, severity)
//! so distinct messages emitted by the same statement collapse into
//! a single record.
//!

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::mem;
use std::str::FromStr;

/// File reported when no caller could be attributed.
pub const UNKNOWN_FILE: &str = "unknown";

/// The severities we attribute volume to. `Print` covers
/// console output that does not go through the logging facade.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Severity {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    Print,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warn => "WARN",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
            Severity::Trace => "TRACE",
            Severity::Print => "PRINT",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&tracing::Level> for Severity {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => Severity::Error,
            tracing::Level::WARN => Severity::Warn,
            tracing::Level::INFO => Severity::Info,
            tracing::Level::DEBUG => Severity::Debug,
            tracing::Level::TRACE => Severity::Trace,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown severity `{0}`")]
pub struct ParseSeverityError(String);

impl FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Severity::Error),
            "WARN" | "WARNING" => Ok(Severity::Warn),
            "INFO" => Ok(Severity::Info),
            "DEBUG" => Ok(Severity::Debug),
            "TRACE" => Ok(Severity::Trace),
            "PRINT" => Ok(Severity::Print),
            _ => Err(ParseSeverityError(s.to_string())),
        }
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Aggregation key. Only the location and the severity take part in
/// it: cost is attributed per statement, not per message variant.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SiteKey {
    pub file: String,
    pub line: u32,
    pub level: Severity,
}

impl SiteKey {
    pub fn new(file: impl Into<String>, line: u32, level: Severity) -> Self {
        Self {
            file: file.into(),
            line,
            level,
        }
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}|{}", self.file, self.line, self.level)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed site key `{0}`, expected `file:line|LEVEL`")]
pub struct ParseSiteKeyError(String);

impl FromStr for SiteKey {
    type Err = ParseSiteKeyError;

    /// File names may contain `:` or `|`, so both separators are
    /// looked up from the right.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseSiteKeyError(s.to_string());
        let (location, level) = s.rsplit_once('|').ok_or_else(malformed)?;
        let (file, line) = location.rsplit_once(':').ok_or_else(malformed)?;
        Ok(SiteKey {
            file: file.to_string(),
            line: line.parse().map_err(|_| malformed())?,
            level: level.parse().map_err(|_| malformed())?,
        })
    }
}

impl Serialize for SiteKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SiteKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Accumulated volume of a single call site.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CallSiteRecord {
    pub file: String,
    pub line: u32,
    pub level: Severity,
    pub message_template: String,
    pub count: u64,
    pub bytes: u64,
}

impl CallSiteRecord {
    fn empty(key: &SiteKey, message_template: String) -> Self {
        Self {
            file: key.file.clone(),
            line: key.line,
            level: key.level,
            message_template,
            count: 0,
            bytes: 0,
        }
    }

    pub fn key(&self) -> SiteKey {
        SiteKey::new(self.file.clone(), self.line, self.level)
    }

    pub fn bytes_per_call(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.bytes as f64 / self.count as f64
        }
    }
}

/// Point-in-time copy of the accumulated records, ordered by key.
pub type Stats = BTreeMap<SiteKey, CallSiteRecord>;

#[derive(Default)]
pub struct SiteAccumulator {
    sites: HashMap<SiteKey, CallSiteRecord>,
}

impl SiteAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one call of `bytes` bytes for a call site.
    ///
    /// The template is only kept when the key is seen for the first
    /// time; later templates for the same key are ignored.
    pub fn record(&mut self, key: SiteKey, message_template: &str, bytes: u64) {
        let record = self
            .sites
            .entry(key)
            .or_insert_with_key(|key| CallSiteRecord::empty(key, message_template.to_string()));

        record.count += 1;
        record.bytes += bytes;
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Returns an independent, ordered copy of the current state.
    pub fn snapshot(&self) -> Stats {
        self.sites
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect()
    }

    /// Return the current records and clears up the state.
    pub fn flush(&mut self) -> HashMap<SiteKey, CallSiteRecord> {
        mem::take(&mut self.sites)
    }
}

#[cfg(test)]
mod tests {
    use super::{CallSiteRecord, Severity, SiteAccumulator, SiteKey};

    #[test]
    fn empty_batch() {
        let mut accumulator = SiteAccumulator::new();
        assert!(accumulator.is_empty());
        assert!(accumulator.snapshot().is_empty());

        let flushed = accumulator.flush();
        assert_eq!(flushed.keys().len(), 0);
    }

    #[test]
    fn test_multiple_entries() {
        let mut accumulator = SiteAccumulator::new();
        accumulator.record(SiteKey::new("src/app.rs", 10, Severity::Info), "user login", 10);
        accumulator.record(SiteKey::new("src/app.rs", 10, Severity::Warn), "user login", 10);
        accumulator.record(SiteKey::new("src/worker.rs", 20, Severity::Info), "job done", 8);

        assert_eq!(accumulator.len(), 3);
        let stats = accumulator.snapshot();
        let record = &stats[&SiteKey::new("src/worker.rs", 20, Severity::Info)];
        assert_eq!(record.count, 1);
        assert_eq!(record.bytes, 8);
        assert_eq!(record.message_template, "job done");

        let flushed = accumulator.flush();
        assert_eq!(flushed.keys().len(), 3);
        assert!(accumulator.flush().is_empty());
    }

    #[test]
    fn test_merge_entries_keeps_first_template() {
        let mut accumulator = SiteAccumulator::new();
        let key = SiteKey::new("src/app.rs", 42, Severity::Error);
        accumulator.record(key.clone(), "failed order {}", 14);
        accumulator.record(key.clone(), "failed payment {}", 16);
        accumulator.record(key.clone(), "failed refund {}", 15);

        let stats = accumulator.snapshot();
        assert_eq!(
            stats[&key],
            CallSiteRecord {
                file: "src/app.rs".to_string(),
                line: 42,
                level: Severity::Error,
                message_template: "failed order {}".to_string(),
                count: 3,
                bytes: 45,
            }
        );
    }

    #[test]
    fn snapshot_is_detached() {
        let mut accumulator = SiteAccumulator::new();
        accumulator.record(SiteKey::new("a.rs", 1, Severity::Info), "msg", 3);

        let mut stats = accumulator.snapshot();
        stats.clear();

        assert_eq!(accumulator.len(), 1);
    }

    #[test]
    fn site_key_text_form() {
        let key = SiteKey::new("C:/proj|x/src/main.rs", 7, Severity::Print);
        let text = key.to_string();
        assert_eq!(text, "C:/proj|x/src/main.rs:7|PRINT");
        assert_eq!(text.parse::<SiteKey>().unwrap(), key);

        assert!("no-separators".parse::<SiteKey>().is_err());
        assert!("file.rs:abc|INFO".parse::<SiteKey>().is_err());
        assert!("file.rs:3|LOUD".parse::<SiteKey>().is_err());
    }

    #[test]
    fn severity_accepts_warning_alias() {
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Warn);
        assert_eq!("PRINT".parse::<Severity>().unwrap(), Severity::Print);
    }
}
