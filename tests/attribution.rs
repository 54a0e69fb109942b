#[path = "support/log_helper.rs"]
mod log_helper;

use std::sync::Arc;

use logcost::config::TrackerConfig;
use logcost::accumulator::UNKNOWN_FILE;
use logcost::{LogCostTracker, Severity};
use tracing_subscriber::prelude::*;

fn only_file(tracker: &LogCostTracker) -> String {
    let stats = tracker.get_stats();
    assert_eq!(stats.len(), 1, "expected a single record, got {:?}", stats);
    stats.into_values().next().unwrap().file
}

#[test]
fn test_helper_owns_call_by_default() {
    let tracker = LogCostTracker::new(TrackerConfig::default());
    log_helper::log_order(&tracker, 7);

    assert!(only_file(&tracker).ends_with("tests/support/log_helper.rs"));
}

#[test]
fn test_ignored_helper_attributes_to_caller() {
    let tracker = LogCostTracker::new(TrackerConfig::default());
    assert!(tracker.add_skip_module("attribution::log_helper"));
    log_helper::log_order(&tracker, 7);

    let file = only_file(&tracker);
    assert!(file.ends_with("tests/attribution.rs"), "attributed to {}", file);
}

#[test]
fn test_ignored_helper_event_attributes_to_caller() {
    let tracker = Arc::new(LogCostTracker::new(TrackerConfig::default()));
    let subscriber = tracing_subscriber::registry().with(tracker.layer());

    tracing::subscriber::with_default(subscriber, || log_helper::emit_order(1));
    assert!(only_file(&tracker).ends_with("tests/support/log_helper.rs"));

    tracker.reset();
    tracker.add_skip_module("attribution::log_helper");
    let subscriber = tracing_subscriber::registry().with(tracker.layer());
    tracing::subscriber::with_default(subscriber, || log_helper::emit_order(2));
    assert!(only_file(&tracker).ends_with("tests/attribution.rs"));
}

#[test]
fn test_stack_depth_limit_results_in_unknown_file() {
    let tracker = LogCostTracker::new(TrackerConfig {
        max_stack_depth: 1,
        ..TrackerConfig::default()
    });
    tracker.track_call(Severity::Info, "depth test", &[]);

    let record = tracker.get_stats().into_values().next().unwrap();
    assert_eq!(record.file, UNKNOWN_FILE);
    assert_eq!(record.line, 0);
    assert_eq!(record.count, 1);
}
