use std::sync::Arc;
use std::thread;

use logcost::config::{self, Config, TrackerConfig};
use logcost::{Frame, LogCostTracker, Message, Severity, Stats};
use serial_test::serial;

fn populated(config: TrackerConfig) -> Arc<LogCostTracker> {
    let tracker = Arc::new(LogCostTracker::new(config));
    for line in 1..=3 {
        tracker.track(
            Severity::Info,
            Message::Text("payload"),
            Some(Frame::new(Some("app"), Some("src/main.rs"), line)),
        );
    }
    tracker
}

#[test]
fn test_concurrent_exports_to_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("a/b/c/stats.json");
    let tracker = populated(TrackerConfig::default());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            let output = output.clone();
            thread::spawn(move || tracker.export(Some(&output)).unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), output);
    }

    let data: Stats = serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(data, tracker.get_stats());
    // Only the destination is left behind, no temporary files.
    assert_eq!(std::fs::read_dir(output.parent().unwrap()).unwrap().count(), 1);
}

#[test]
fn test_export_keys_are_readable() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("stats.json");
    populated(TrackerConfig::default()).export(Some(&output)).unwrap();

    let text = std::fs::read_to_string(&output).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    let entry = &value["src/main.rs:2|INFO"];
    assert_eq!(entry["count"], 1);
    assert_eq!(entry["bytes"], 7);
    assert_eq!(entry["level"], "INFO");
    assert_eq!(entry["message_template"], "payload");
}

#[test]
#[serial]
fn test_export_uses_env_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("env/stats.json");
    std::env::set_var(config::OUTPUT_ENV, &output);

    let loaded = Config::from_env();
    std::env::remove_var(config::OUTPUT_ENV);
    assert_eq!(loaded.tracker.output_path, output);

    let tracker = populated(loaded.tracker);
    assert_eq!(tracker.export(None).unwrap(), output);
    assert!(output.exists());
}

#[test]
#[serial]
fn test_default_output_is_in_temp_dir() {
    std::env::remove_var(config::OUTPUT_ENV);
    assert_eq!(
        config::output_path_from_env(),
        std::env::temp_dir().join(config::DEFAULT_OUTPUT_FILE)
    );
}
