//! Configuration loading from environment variables.
//!
//! All values are read from `LOGCOST_*` variables with defaults. Invalid
//! values are reported with a warning and fall back to the default.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `LOGCOST_OUTPUT` | `<temp dir>/logcost_stats.json` | Export destination |
//! | `LOGCOST_FLUSH_INTERVAL` | 0 | Seconds between periodic exports (0 disables) |
//! | `LOGCOST_MAX_FILE_SIZE` | 10485760 | Rotate the destination at this size (0 disables) |
//! | `LOGCOST_MAX_BACKUPS` | 5 | Rotated files to keep |
//! | `LOGCOST_MAX_STACK_DEPTH` | 64 | Frames inspected when attributing a call |
//! | `LOGCOST_MAX_SKIP_PREFIXES` | 128 | Capacity of user-registered skip prefixes |

use std::path::PathBuf;
use std::time::Duration;
use tracing::{event, Level};

use crate::stack::DEFAULT_MAX_SKIP_PREFIXES;

pub const OUTPUT_ENV: &str = "LOGCOST_OUTPUT";
pub const DEFAULT_OUTPUT_FILE: &str = "logcost_stats.json";
pub const DEFAULT_MAX_STACK_DEPTH: usize = 64;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_BACKUPS: usize = 5;

/// Settings of the tracking engine itself.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Frames inspected before attribution gives up.
    pub max_stack_depth: usize,
    /// Capacity for user-registered skip prefixes.
    pub max_skip_prefixes: usize,
    /// Paths under this directory are reported relative to it.
    pub root: PathBuf,
    /// Destination used by `export` when none is given.
    pub output_path: PathBuf,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            max_skip_prefixes: DEFAULT_MAX_SKIP_PREFIXES,
            root: std::env::current_dir().unwrap_or_default(),
            output_path: default_output_path(),
        }
    }
}

/// Settings of the periodic flusher.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// `None` disables the background flusher.
    pub interval: Option<Duration>,
    /// `None` disables rotation.
    pub max_file_size: Option<u64>,
    pub max_backups: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: None,
            max_file_size: Some(DEFAULT_MAX_FILE_SIZE),
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub flush: FlushConfig,
}

fn default_output_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_OUTPUT_FILE)
}

/// Export destination: `LOGCOST_OUTPUT` if set, the temp dir otherwise.
pub fn output_path_from_env() -> PathBuf {
    match std::env::var(OUTPUT_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => default_output_path(),
    }
}

/// Parse an integer env var, returning `default` on missing or invalid.
fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match std::env::var(key) {
        Ok(val) => match val.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                event!(
                    Level::WARN,
                    "Invalid value for {}: {:?}. Using default {}.",
                    key,
                    val,
                    default
                );
                default
            }
        },
        Err(_) => default,
    }
}

impl Config {
    /// Load all configuration from environment variables.
    pub fn from_env() -> Self {
        let max_stack_depth = parse_env("LOGCOST_MAX_STACK_DEPTH", DEFAULT_MAX_STACK_DEPTH).max(1);
        let max_skip_prefixes = parse_env("LOGCOST_MAX_SKIP_PREFIXES", DEFAULT_MAX_SKIP_PREFIXES);

        let interval_secs = parse_env("LOGCOST_FLUSH_INTERVAL", 0u64);
        let max_file_size = parse_env("LOGCOST_MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE);
        let max_backups = parse_env("LOGCOST_MAX_BACKUPS", DEFAULT_MAX_BACKUPS);

        Config {
            tracker: TrackerConfig {
                max_stack_depth,
                max_skip_prefixes,
                output_path: output_path_from_env(),
                ..TrackerConfig::default()
            },
            flush: FlushConfig {
                interval: (interval_secs > 0).then(|| Duration::from_secs(interval_secs)),
                max_file_size: (max_file_size > 0).then_some(max_file_size),
                max_backups,
            },
        }
    }
}
