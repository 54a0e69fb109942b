//! Per-call-site accounting of log volume.
//!
//! Every `tracing` event and every tracked print is attributed to the
//! source line that emitted it and accumulated as a count and a byte
//! total per `(file, line, level)`. Stats can be exported to JSON and
//! analyzed for ingestion cost.
//!
//! ```no_run
//! logcost::install();
//! let _export = logcost::export_on_exit();
//!
//! tracing::info!(order = 42, "order submitted");
//! let stats = logcost::get_stats();
//! ```
//!
//! Events are attributed from their own callsite. Calls made through an
//! ignored module and [`LogCostTracker::track_call`] walk the native stack
//! instead, which needs line tables in the binary. Release builds need
//!
//! ```toml
//! [profile.release]
//! debug = "line-tables-only"
//! ```
//!
//! Without them such calls are attributed to `unknown:0` and a warning is
//! logged once.

pub mod accumulator;
pub mod analyzer;
pub mod config;
pub mod console;
pub mod estimate;
pub mod flusher;
pub mod layer;
pub mod report;
pub mod sink;
pub mod stack;
pub mod tracker;

pub use accumulator::{CallSiteRecord, Severity, SiteKey, Stats};
pub use analyzer::{diff_stats, AnalysisReport, AnalyzeError, CostAnalyzer, Provider};
pub use config::Config;
pub use estimate::Message;
pub use flusher::{FlushHandle, Flusher};
pub use layer::{AttributedFormat, CostLayer};
pub use sink::{ExportError, FileSink, StatsSink};
pub use stack::{BacktraceWalker, Frame, StackWalker};
pub use tracker::{CallSite, LogCostTracker, TrackError};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, OnceLock};

use parking_lot::Mutex;
use tracing::{event, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

static CONFIG: OnceLock<Config> = OnceLock::new();
static TRACKER: OnceLock<Arc<LogCostTracker>> = OnceLock::new();
static INSTALL: Once = Once::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);
static FLUSHER: Mutex<Option<FlushHandle>> = parking_lot::const_mutex(None);

fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// The process-wide tracker. Created on first use from the environment
/// configuration; it only sees events once [`install`] ran or its
/// [`layer`] was added to a subscriber.
pub fn tracker() -> &'static Arc<LogCostTracker> {
    TRACKER.get_or_init(|| Arc::new(LogCostTracker::new(config().tracker.clone())))
}

#[doc(hidden)]
pub fn installed_tracker() -> Option<&'static Arc<LogCostTracker>> {
    INSTALLED.load(Ordering::Acquire).then(tracker)
}

/// Activates tracking for the whole process. Only the first call has an
/// effect.
///
/// Registers a global subscriber that tracks every event before writing
/// it to stdout with the resolved caller, arms the tracking print macros
/// and starts the periodic flusher when `LOGCOST_FLUSH_INTERVAL` is set.
/// If the application already set a global subscriber, it must add
/// [`layer`] to it itself.
pub fn install() {
    INSTALL.call_once(|| {
        let tracker = tracker();

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(tracker.layer())
            .with(fmt::layer().event_format(AttributedFormat));
        if let Err(err) = subscriber.try_init() {
            event!(
                Level::WARN,
                "A global subscriber is already set, add logcost::layer() to it. {}",
                err
            );
        }

        INSTALLED.store(true, Ordering::Release);

        let flush = &config().flush;
        if let Some(interval) = flush.interval {
            let sink = FileSink::new(tracker.config().output_path.clone())
                .with_rotation(flush.max_file_size, flush.max_backups);
            match Flusher::spawn(Arc::clone(tracker), Box::new(sink), interval) {
                Ok(handle) => *FLUSHER.lock() = Some(handle),
                Err(err) => event!(Level::ERROR, "Failed to start the flusher. {}", err),
            }
        }

        event!(Level::DEBUG, "LogCost installed.");
    });
}

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

/// A layer feeding the process-wide tracker, for applications that
/// build their own subscriber.
pub fn layer() -> CostLayer {
    tracker().layer()
}

pub fn get_stats() -> Stats {
    tracker().get_stats()
}

pub fn reset() {
    tracker().reset()
}

/// Writes the process-wide stats to `path`, or to `LOGCOST_OUTPUT`.
pub fn export(path: Option<&Path>) -> Result<PathBuf, ExportError> {
    tracker().export(path)
}

/// Attributes calls made from modules starting with `prefix` to their
/// caller instead. Returns `false` when the prefix set is full.
///
/// Finding the caller walks the stack, so release builds need
/// `debug = "line-tables-only"` (see the crate docs).
pub fn ignore_module(prefix: &str) -> bool {
    tracker().add_skip_module(prefix)
}

/// Exports the stats when dropped, after stopping the flusher. Keep it
/// alive in `main`.
#[must_use = "stats are exported when the guard is dropped"]
pub struct ExportGuard {
    _private: (),
}

pub fn export_on_exit() -> ExportGuard {
    ExportGuard { _private: () }
}

impl Drop for ExportGuard {
    fn drop(&mut self) {
        if !is_installed() {
            return;
        }
        if let Some(handle) = FLUSHER.lock().take() {
            handle.stop();
        }
        match export(None) {
            Ok(path) => event!(Level::DEBUG, path = %path.display(), "Stats exported on exit."),
            Err(err) => event!(Level::ERROR, "Failed to export stats on exit. {}", err),
        }
    }
}
