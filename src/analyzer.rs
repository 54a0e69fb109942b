//! Cost analysis of collected stats.
//!
//! Turns per-site byte volumes into estimated ingestion cost for a cloud
//! provider, flags common logging anti-patterns and estimates the return
//! of reducing volume.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::accumulator::{CallSiteRecord, Severity, SiteKey, Stats};

/// Calls per site above which a statement is reported as high volume.
pub const DEFAULT_LOOP_THRESHOLD: u64 = 1000;
/// Average bytes per call above which a payload is reported as large.
pub const DEFAULT_LARGE_MSG_THRESHOLD: f64 = 5_000.0;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("failed to read stats file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("stats file {path} must contain an object of call sites")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("reduction_percent must be between 0 and 1")]
    InvalidReduction,

    #[error("hours_to_fix and hourly_rate must be non-negative")]
    InvalidEffort,
}

/// Cloud logging providers with a known ingestion price.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Provider {
    Gcp,
    Aws,
    Azure,
}

impl Provider {
    /// Ingestion price in USD per GiB.
    pub fn price_per_gb(&self) -> f64 {
        match self {
            Provider::Gcp => 0.50,
            Provider::Aws => 0.57,
            Provider::Azure => 0.63,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Provider::Gcp => write!(f, "gcp"),
            Provider::Aws => write!(f, "aws"),
            Provider::Azure => write!(f, "azure"),
        }
    }
}

impl FromStr for Provider {
    type Err = AnalyzeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gcp" => Ok(Provider::Gcp),
            "aws" => Ok(Provider::Aws),
            "azure" => Ok(Provider::Azure),
            _ => Err(AnalyzeError::UnknownProvider(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CostEntry {
    pub key: String,
    pub file: String,
    pub line: u32,
    pub level: Severity,
    pub message_template: String,
    pub count: u64,
    pub bytes: u64,
    pub bytes_per_call: f64,
    pub cost: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct AnalysisReport {
    pub provider: String,
    pub currency: String,
    pub total_bytes: u64,
    pub total_cost: f64,
    pub entries: Vec<CostEntry>,
    pub top_entries: Vec<CostEntry>,
    pub anti_patterns: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RoiEstimate {
    pub potential_savings: f64,
    pub effort_cost: f64,
    pub net_savings: f64,
    pub roi: f64,
}

/// Reads a stats file written by [`crate::export`].
pub fn load_stats(path: &Path) -> Result<Stats, AnalyzeError> {
    let text = fs::read_to_string(path).map_err(|source| AnalyzeError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| AnalyzeError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub struct CostAnalyzer {
    stats: Stats,
    provider: String,
    currency: String,
    price_per_gb: f64,
}

impl CostAnalyzer {
    /// `price_per_gb` overrides the provider's price; with an override
    /// any provider name is accepted.
    pub fn new(
        stats: Stats,
        provider: &str,
        currency: &str,
        price_per_gb: Option<f64>,
    ) -> Result<Self, AnalyzeError> {
        let price_per_gb = match price_per_gb {
            Some(price) => price,
            None => provider.parse::<Provider>()?.price_per_gb(),
        };
        Ok(Self {
            stats,
            provider: provider.to_ascii_lowercase(),
            currency: currency.to_string(),
            price_per_gb,
        })
    }

    pub fn from_file(
        path: &Path,
        provider: &str,
        currency: &str,
        price_per_gb: Option<f64>,
    ) -> Result<Self, AnalyzeError> {
        Self::new(load_stats(path)?, provider, currency, price_per_gb)
    }

    fn bytes_to_cost(&self, bytes: u64) -> f64 {
        bytes as f64 / BYTES_PER_GB * self.price_per_gb
    }

    fn entry(&self, key: &SiteKey, record: &CallSiteRecord) -> CostEntry {
        CostEntry {
            key: key.to_string(),
            file: record.file.clone(),
            line: record.line,
            level: record.level,
            message_template: record.message_template.clone(),
            count: record.count,
            bytes: record.bytes,
            bytes_per_call: record.bytes_per_call(),
            cost: self.bytes_to_cost(record.bytes),
        }
    }

    pub fn build_report(&self, top_n: usize) -> AnalysisReport {
        let mut entries: Vec<CostEntry> = self
            .stats
            .iter()
            .map(|(key, record)| self.entry(key, record))
            .collect();
        // Stable sort keeps key order among equal costs.
        entries.sort_by(|a, b| b.cost.total_cmp(&a.cost));

        let top_entries = entries.iter().take(top_n).cloned().collect();
        let total_bytes = entries.iter().map(|entry| entry.bytes).sum();
        let total_cost = entries.iter().map(|entry| entry.cost).sum();
        let anti_patterns = self.detect_anti_patterns(&entries);
        let recommendations = build_recommendations(&entries, &anti_patterns);

        AnalysisReport {
            provider: self.provider.clone(),
            currency: self.currency.clone(),
            total_bytes,
            total_cost,
            entries,
            top_entries,
            anti_patterns,
            recommendations,
        }
    }

    fn detect_anti_patterns(&self, entries: &[CostEntry]) -> Vec<String> {
        let mut findings = Vec::new();
        for entry in entries {
            if entry.count >= DEFAULT_LOOP_THRESHOLD {
                findings.push(format!(
                    "High log volume ({} calls) at {}:{}",
                    entry.count, entry.file, entry.line
                ));
            }
            if entry.level == Severity::Debug && entry.cost > 0.0 {
                findings.push(format!(
                    "DEBUG log in production at {}:{} costing {:.2} {}",
                    entry.file, entry.line, entry.cost, self.currency
                ));
            }
            if entry.bytes_per_call >= DEFAULT_LARGE_MSG_THRESHOLD {
                findings.push(format!(
                    "Large log payload (~{} bytes/call) at {}:{}",
                    entry.bytes_per_call as u64, entry.file, entry.line
                ));
            }
        }
        findings
    }

    /// Estimates savings against the effort of cutting volume by
    /// `reduction_percent` (0 to 1).
    pub fn estimate_roi(
        &self,
        reduction_percent: f64,
        hours_to_fix: f64,
        hourly_rate: f64,
    ) -> Result<RoiEstimate, AnalyzeError> {
        if !(0.0..=1.0).contains(&reduction_percent) {
            return Err(AnalyzeError::InvalidReduction);
        }
        if hours_to_fix < 0.0 || hourly_rate < 0.0 {
            return Err(AnalyzeError::InvalidEffort);
        }

        let total_cost: f64 = self
            .stats
            .values()
            .map(|record| self.bytes_to_cost(record.bytes))
            .sum();
        let potential_savings = total_cost * reduction_percent;
        let effort_cost = hours_to_fix * hourly_rate;
        let net_savings = potential_savings - effort_cost;
        let roi = if effort_cost > 0.0 {
            net_savings / effort_cost
        } else if net_savings > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        Ok(RoiEstimate {
            potential_savings,
            effort_cost,
            net_savings,
            roi,
        })
    }
}

fn build_recommendations(entries: &[CostEntry], anti_patterns: &[String]) -> Vec<String> {
    let mut recommendations = Vec::new();
    if let Some(heaviest) = entries.first() {
        let template: String = heaviest.message_template.chars().take(60).collect();
        recommendations.push(format!(
            "Refactor or sample {}:{} ({}...) to cut the largest cost contributor.",
            heaviest.file, heaviest.line, template
        ));
    }
    if !anti_patterns.is_empty() {
        recommendations.push("Address detected anti-patterns to reduce cost spikes.".to_string());
    }
    if recommendations.is_empty() {
        recommendations.push("Logging costs look healthy. Continue monitoring.".to_string());
    }
    recommendations
}

/// Differences between two snapshots.
#[derive(Debug, Default, PartialEq)]
pub struct StatsDiff {
    pub added: Vec<CallSiteRecord>,
    pub removed: Vec<SiteKey>,
    /// (before, after) for sites whose count or bytes changed.
    pub changed: BTreeMap<SiteKey, (CallSiteRecord, CallSiteRecord)>,
}

impl StatsDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub fn diff_stats(before: &Stats, after: &Stats) -> StatsDiff {
    let mut diff = StatsDiff::default();
    for (key, record) in after {
        match before.get(key) {
            None => diff.added.push(record.clone()),
            Some(old) if old.count != record.count || old.bytes != record.bytes => {
                diff.changed
                    .insert(key.clone(), (old.clone(), record.clone()));
            }
            Some(_) => {}
        }
    }
    diff.removed = before
        .keys()
        .filter(|key| !after.contains_key(key))
        .cloned()
        .collect();
    diff
}
