use crate::accumulator::{Severity, SiteAccumulator, SiteKey, Stats, UNKNOWN_FILE};
use crate::config::TrackerConfig;
use crate::estimate::Message;
use crate::layer::CostLayer;
use crate::sink::{self, ExportError};
use crate::stack::{self, BacktraceWalker, Frame, SkipRules, StackWalker};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, Level};

/// Internal failures of the tracking path. None of them ever reaches
/// the application: `track` degrades to default attribution or raw sizes.
#[derive(Error, Debug)]
pub enum TrackError {
    #[error("no caller frame within {max_depth} frames")]
    NoCaller { max_depth: usize },

    #[error("malformed placeholder at byte {position}")]
    MalformedTemplate { position: usize },

    #[error("unsupported format spec at byte {position}")]
    UnsupportedFormat { position: usize },

    #[error("placeholder {index} has no argument, {supplied} supplied")]
    MissingArgument { index: usize, supplied: usize },

    #[error("argument {index} is not used by the template")]
    UnusedArgument { index: usize },

    #[error("argument formatting failed")]
    Format(#[from] fmt::Error),

    #[error("argument formatting panicked")]
    FormatPanicked,
}

/// The attributed location of a call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallSite {
    /// Path as reported by the frame, before normalization.
    pub raw_file: String,
    /// Path used in the aggregation key.
    pub file: String,
    pub line: u32,
    pub module: Option<String>,
}

impl CallSite {
    fn unknown() -> Self {
        Self {
            raw_file: UNKNOWN_FILE.to_string(),
            file: UNKNOWN_FILE.to_string(),
            line: 0,
            module: None,
        }
    }
}

/// This is the engine that attributes every intercepted call to a
/// call site and accumulates its volume.
///
/// A tracker is shared between threads behind an `Arc`. Most applications
/// use the process-wide instance activated by [`crate::install`]; tests and
/// embedders can own one and attach it with [`LogCostTracker::layer`].
///
/// The map is only locked for the insert or update itself. Caller
/// resolution and message formatting run outside the lock.
///
/// Walking the stack needs source locations in the binary. Release
/// builds have none by default; set `debug = "line-tables-only"` under
/// `[profile.release]`, or every walked call lands on `unknown:0`.
pub struct LogCostTracker {
    accumulator: Mutex<SiteAccumulator>,
    rules: RwLock<SkipRules>,
    walker: Box<dyn StackWalker>,
    config: TrackerConfig,
    line_tables_warned: AtomicBool,
}

impl Default for LogCostTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl LogCostTracker {
    /// Instantiates a tracker that walks the native stack of the
    /// calling thread.
    pub fn new(config: TrackerConfig) -> Self {
        Self::new_with_walker(config, Box::new(BacktraceWalker))
    }

    /// Leaves the responsibility to provide the stack walker to the
    /// caller. Most of the times you should not need to use this.
    pub fn new_with_walker(config: TrackerConfig, walker: Box<dyn StackWalker>) -> Self {
        let rules = SkipRules::with_defaults(config.max_skip_prefixes);
        Self {
            accumulator: Mutex::new(SiteAccumulator::new()),
            rules: RwLock::new(rules),
            walker,
            config,
            line_tables_warned: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// A `tracing` layer feeding every event to this tracker.
    pub fn layer(self: &Arc<Self>) -> CostLayer {
        CostLayer::new(Arc::clone(self))
    }

    /// Records one intercepted call and returns where it was attributed.
    ///
    /// `callsite` is the location the logging facade reported, if any. It
    /// is used as the innermost frame; the stack is only walked when it
    /// belongs to a skipped module.
    ///
    /// Never fails and never panics: attribution falls back to `unknown`,
    /// the size to the raw template, and a fault anywhere else drops the
    /// call from the stats and returns `None`.
    pub fn track(
        &self,
        level: Severity,
        message: Message<'_>,
        callsite: Option<Frame>,
    ) -> Option<CallSite> {
        panic::catch_unwind(AssertUnwindSafe(|| self.record(level, message, callsite))).ok()
    }

    fn record(&self, level: Severity, message: Message<'_>, callsite: Option<Frame>) -> CallSite {
        let site = self.resolve(callsite).unwrap_or_else(|_| CallSite::unknown());
        let bytes = message.estimated_size() as u64;

        let key = SiteKey::new(site.file.clone(), site.line, level);
        self.accumulator
            .lock()
            .record(key, message.template(), bytes);
        site
    }

    /// Records a call with a `{}` template and positional arguments,
    /// attributing it by walking the stack of the calling thread.
    ///
    /// Attribution needs line tables, see the type level docs.
    pub fn track_call(&self, level: Severity, template: &str, args: &[&dyn fmt::Display]) {
        self.track(level, Message::Template { template, args }, None);
    }

    /// Resolves the caller for a call reported at `callsite`.
    pub fn resolve(&self, callsite: Option<Frame>) -> Result<CallSite, TrackError> {
        let max_depth = self.config.max_stack_depth;
        let resolution = {
            let rules = self.rules.read();
            stack::resolve_caller(callsite, self.walker.as_ref(), &rules, max_depth)
        };
        if resolution.missing_line_tables
            && !self.line_tables_warned.swap(true, Ordering::Relaxed)
        {
            event!(
                Level::WARN,
                "Stack frames carry no source locations, calls are attributed to unknown. \
                 Build with `debug = \"line-tables-only\"` to attribute them."
            );
        }
        let frame = resolution.caller.ok_or(TrackError::NoCaller { max_depth })?;

        let raw = frame.file.unwrap_or_else(|| PathBuf::from(UNKNOWN_FILE));
        Ok(CallSite {
            file: normalize_path(&raw, &self.config.root),
            raw_file: raw.to_string_lossy().into_owned(),
            line: frame.line,
            module: frame.module,
        })
    }

    /// Skips frames of modules starting with `prefix` when attributing.
    /// Returns `false` if the prefix was dropped because the set is full.
    pub fn add_skip_module(&self, prefix: &str) -> bool {
        self.rules.write().add_module(prefix)
    }

    /// Skips frames whose source path ends with or contains `pattern`.
    pub fn add_skip_path(&self, pattern: &str) {
        self.rules.write().add_path(pattern)
    }

    pub fn skip_module_count(&self) -> usize {
        self.rules.read().module_count()
    }

    /// Returns a copy of the accumulated stats.
    pub fn get_stats(&self) -> Stats {
        self.accumulator.lock().snapshot()
    }

    /// Clears all accumulated stats.
    pub fn reset(&self) {
        self.accumulator.lock().flush();
    }

    /// Exports a snapshot to `path`, or to the configured output path.
    /// Returns the path written.
    pub fn export(&self, path: Option<&Path>) -> Result<PathBuf, ExportError> {
        let path = path.map_or_else(|| self.config.output_path.clone(), Path::to_path_buf);
        let stats = self.get_stats();
        sink::write_atomic(&stats, &path)?;
        Ok(path)
    }
}

/// Makes `path` relative to `root` when it lives below it, reduces
/// other absolute paths to their file name and leaves relative paths
/// as they are.
pub fn normalize_path(path: &Path, root: &Path) -> String {
    if path.is_relative() {
        return to_slash(path);
    }
    if let Ok(relative) = path.strip_prefix(root) {
        if !relative.as_os_str().is_empty() {
            return to_slash(relative);
        }
    }
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| UNKNOWN_FILE.to_string())
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            Component::ParentDir => Some("..".into()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::CaptureLayer;
    use crate::stack::ScriptedWalker;
    use tracing_subscriber::prelude::*;
    use std::thread;

    fn config() -> TrackerConfig {
        TrackerConfig {
            root: PathBuf::from("/srv/app"),
            ..TrackerConfig::default()
        }
    }

    fn app_frames() -> Vec<Frame> {
        vec![
            Frame::new(Some("logcost::tracker::LogCostTracker::track"), Some("src/tracker.rs"), 1),
            Frame::new(Some("app::helpers::log_order"), Some("/srv/app/src/helpers.rs"), 12),
            Frame::new(Some("app::orders::submit"), Some("/srv/app/src/orders.rs"), 88),
        ]
    }

    fn scripted() -> LogCostTracker {
        LogCostTracker::new_with_walker(config(), Box::new(ScriptedWalker { frames: app_frames() }))
    }

    fn only_record(tracker: &LogCostTracker) -> crate::accumulator::CallSiteRecord {
        let stats = tracker.get_stats();
        assert_eq!(stats.len(), 1, "expected a single record, got {:?}", stats);
        stats.into_values().next().unwrap()
    }

    #[test]
    fn test_counts_and_bytes() {
        let tracker = scripted();
        for _ in 0..2 {
            tracker.track_call(Severity::Warn, "hello {}", &[&"world"]);
        }

        let record = only_record(&tracker);
        assert_eq!(record.file, "src/helpers.rs");
        assert_eq!(record.line, 12);
        assert_eq!(record.count, 2);
        assert_eq!(record.bytes, "hello world".len() as u64 * 2);
        assert_eq!(record.message_template, "hello {}");
    }

    #[test]
    fn test_first_template_wins() {
        let tracker = scripted();
        tracker.track(Severity::Info, Message::Text("first"), None);
        tracker.track(Severity::Info, Message::Text("second, longer"), None);

        let record = only_record(&tracker);
        assert_eq!(record.message_template, "first");
        assert_eq!(record.count, 2);
        assert_eq!(record.bytes, ("first".len() + "second, longer".len()) as u64);
    }

    #[test]
    fn test_severity_splits_records() {
        let tracker = scripted();
        tracker.track(Severity::Info, Message::Text("a"), None);
        tracker.track(Severity::Error, Message::Text("a"), None);
        assert_eq!(tracker.get_stats().len(), 2);
    }

    #[test]
    fn test_format_error_counts_template() {
        let tracker = scripted();
        tracker.track_call(Severity::Info, "value: {} {}", &[&"only_one"]);

        let record = only_record(&tracker);
        assert_eq!(record.bytes, "value: {} {}".len() as u64);
        assert_eq!(record.count, 1);
    }

    #[test]
    fn test_get_stats_returns_copy() {
        let tracker = scripted();
        tracker.track(Severity::Info, Message::Text("msg"), None);

        let mut stats = tracker.get_stats();
        stats.clear();
        assert!(!tracker.get_stats().is_empty());

        let mut stats = tracker.get_stats();
        stats.values_mut().for_each(|record| record.count = 1000);
        assert_eq!(only_record(&tracker).count, 1);
    }

    #[test]
    fn test_reset() {
        let tracker = scripted();
        tracker.track(Severity::Error, Message::Text("boom"), None);
        tracker.reset();
        assert!(tracker.get_stats().is_empty());
    }

    #[test]
    fn test_skip_module_finds_real_caller() {
        let tracker = scripted();
        tracker.track(Severity::Info, Message::Text("first"), None);
        assert_eq!(only_record(&tracker).file, "src/helpers.rs");

        tracker.reset();
        assert!(tracker.add_skip_module("app::helpers"));
        tracker.track(Severity::Info, Message::Text("second"), None);
        let record = only_record(&tracker);
        assert_eq!(record.file, "src/orders.rs");
        assert_eq!(record.line, 88);
    }

    #[test]
    fn test_callsite_used_before_walking() {
        let tracker = scripted();
        let callsite = Frame::new(Some("app::billing"), Some("src/billing.rs"), 7);
        let site = tracker
            .track(Severity::Info, Message::Text("charge"), Some(callsite))
            .unwrap();
        assert_eq!(site.file, "src/billing.rs");
        assert_eq!(site.line, 7);
    }

    #[test]
    fn test_skip_module_limit() {
        let tracker = LogCostTracker::new_with_walker(
            TrackerConfig {
                max_skip_prefixes: 2,
                ..config()
            },
            Box::new(ScriptedWalker { frames: app_frames() }),
        );
        let before = tracker.skip_module_count();
        assert!(tracker.add_skip_module("module::one"));
        assert!(tracker.add_skip_module("module::two"));
        assert!(!tracker.add_skip_module("module::three"));
        assert_eq!(tracker.skip_module_count(), before + 2);
    }

    #[test]
    fn test_stack_depth_limit_results_in_unknown_file() {
        let tracker = LogCostTracker::new_with_walker(
            TrackerConfig {
                max_stack_depth: 1,
                ..config()
            },
            Box::new(ScriptedWalker { frames: app_frames() }),
        );
        tracker.track(Severity::Info, Message::Text("depth test"), None);

        let record = only_record(&tracker);
        assert_eq!(record.file, UNKNOWN_FILE);
        assert_eq!(record.line, 0);
    }

    #[test]
    fn test_missing_line_tables_warns_once() {
        let frames = vec![
            Frame::new(Some("logcost::tracker::LogCostTracker::track_call"), None, 0),
            Frame::new(Some("app::helpers::log_order"), None, 0),
            Frame::new(Some("app::orders::submit"), None, 0),
        ];
        let tracker =
            LogCostTracker::new_with_walker(config(), Box::new(ScriptedWalker { frames }));
        let capture = CaptureLayer::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());

        tracing::subscriber::with_default(subscriber, || {
            tracker.track_call(Severity::Info, "order {}", &[&1]);
            tracker.track_call(Severity::Info, "order {}", &[&2]);
        });

        let record = only_record(&tracker);
        assert_eq!(record.file, UNKNOWN_FILE);
        assert_eq!(record.count, 2);
        let events = capture.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, Level::WARN);
        assert!(events[0]
            .field("message")
            .is_some_and(|message| message.contains("line-tables-only")));
    }

    #[test]
    fn test_skip_module_overflow_warns() {
        let tracker = LogCostTracker::new_with_walker(
            TrackerConfig {
                max_skip_prefixes: 1,
                ..config()
            },
            Box::new(ScriptedWalker { frames: app_frames() }),
        );
        let capture = CaptureLayer::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());

        tracing::subscriber::with_default(subscriber, || {
            assert!(tracker.add_skip_module("app::helpers"));
            assert!(!tracker.add_skip_module("app::orders"));
        });

        let events = capture.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, Level::WARN);
        assert_eq!(events[0].field("prefix"), Some("app::orders"));
        assert_eq!(events[0].field("limit"), Some("1"));
    }

    #[test]
    fn test_panicking_walker_is_contained() {
        struct Exploding;
        impl StackWalker for Exploding {
            fn walk(&self, _visit: &mut dyn FnMut(Frame) -> bool) {
                panic!("walker exploded");
            }
        }

        let tracker = LogCostTracker::new_with_walker(config(), Box::new(Exploding));
        assert!(tracker.track(Severity::Info, Message::Text("still fine"), None).is_none());
        assert!(tracker.get_stats().is_empty());

        // The lock is not poisoned by the panic.
        let callsite = Frame::new(Some("app"), Some("src/main.rs"), 1);
        tracker.track(Severity::Info, Message::Text("next"), Some(callsite));
        assert_eq!(only_record(&tracker).count, 1);
    }

    #[test]
    fn test_thread_safe_tracking() {
        let tracker = Arc::new(scripted());
        let total_threads = 5;
        let per_thread = 50;

        let handles: Vec<_> = (0..total_threads)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        tracker.track(Severity::Info, Message::Text("thread-msg"), None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let record = only_record(&tracker);
        assert_eq!(record.count, total_threads * per_thread);
        assert_eq!(record.bytes, total_threads * per_thread * "thread-msg".len() as u64);
    }

    #[test]
    fn test_export_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = scripted();
        tracker.track(Severity::Error, Message::Text("boom"), None);

        let output = dir.path().join("stats.json");
        let exported = tracker.export(Some(&output)).unwrap();
        assert_eq!(exported, output);
        let text = std::fs::read_to_string(&exported).unwrap();
        let data: Stats = serde_json::from_str(&text).unwrap();
        assert_eq!(data, tracker.get_stats());

        tracker.reset();
        assert!(tracker.get_stats().is_empty());
    }

    #[test]
    fn test_export_uses_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("configured/stats.json");
        let tracker = LogCostTracker::new_with_walker(
            TrackerConfig {
                output_path: output.clone(),
                ..config()
            },
            Box::new(ScriptedWalker { frames: app_frames() }),
        );
        tracker.track(Severity::Info, Message::Text("env msg"), None);

        assert_eq!(tracker.export(None).unwrap(), output);
        assert!(output.exists());
    }

    #[test]
    fn test_normalize_path() {
        let root = Path::new("/srv/app");
        assert_eq!(normalize_path(Path::new("/srv/app/src/main.rs"), root), "src/main.rs");
        assert_eq!(normalize_path(Path::new("/opt/other/lib.rs"), root), "lib.rs");
        assert_eq!(normalize_path(Path::new("src/main.rs"), root), "src/main.rs");
        assert_eq!(normalize_path(Path::new("./src/main.rs"), root), "src/main.rs");
    }
}
