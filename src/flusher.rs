//! Periodic export of the accumulated stats.
//!
//! A [`Flusher`] owns one background thread that writes a snapshot of a
//! tracker to a [`StatsSink`] every `interval`, and once more when it is
//! stopped. Stats are not cleared by a flush; every export contains the
//! totals since start (or since the last `reset`).

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{event, Level};

use crate::sink::StatsSink;
use crate::tracker::LogCostTracker;

/// Longest sleep between two schedule checks.
const MAX_TICK: Duration = Duration::from_secs(1);

/// Decides when the next flush is due.
#[derive(Debug, Clone)]
pub struct FlushSchedule {
    interval: chrono::Duration,
    last_flush: DateTime<Local>,
}

impl FlushSchedule {
    /// A schedule whose first flush is due one `interval` after `start`.
    pub fn new(interval: Duration, start: DateTime<Local>) -> Self {
        Self {
            interval: chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX),
            last_flush: start,
        }
    }

    /// Returns true once at least `interval` has passed since the last
    /// flush.
    pub fn should_flush(&self, current_time: DateTime<Local>) -> bool {
        current_time - self.last_flush >= self.interval
    }

    pub fn mark_flushed(&mut self, current_time: DateTime<Local>) {
        self.last_flush = current_time;
    }
}

fn flush_once(tracker: &LogCostTracker, sink: &mut dyn StatsSink) {
    match sink.write(&tracker.get_stats()) {
        Ok(()) => event!(Level::DEBUG, "Stats flushed."),
        Err(err) => event!(Level::ERROR, "Stats flush failed. {}", err),
    }
}

pub struct Flusher;

impl Flusher {
    /// Starts the background thread.
    pub fn spawn(
        tracker: Arc<LogCostTracker>,
        mut sink: Box<dyn StatsSink + Send>,
        interval: Duration,
    ) -> io::Result<FlushHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let tick = interval.min(MAX_TICK).max(Duration::from_millis(1));

        let thread = thread::Builder::new()
            .name("logcost-flusher".to_string())
            .spawn(move || {
                let mut schedule = FlushSchedule::new(interval, Local::now());
                loop {
                    match stopped.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {
                            let now = Local::now();
                            if schedule.should_flush(now) {
                                flush_once(&tracker, sink.as_mut());
                                schedule.mark_flushed(now);
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            flush_once(&tracker, sink.as_mut());
                            break;
                        }
                    }
                }
            })?;

        event!(Level::DEBUG, interval_ms = interval.as_millis() as u64, "Flusher started.");
        Ok(FlushHandle {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

/// Stops the flusher when dropped, after a final flush.
pub struct FlushHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl FlushHandle {
    /// Requests a final flush and waits for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                event!(Level::ERROR, "Flusher thread panicked.");
            }
        }
    }
}

impl Drop for FlushHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::Severity;
    use crate::config::TrackerConfig;
    use crate::estimate::Message;
    use crate::sink::DummySink;
    use crate::stack::Frame;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    #[test]
    fn schedule_waits_for_interval() {
        let start = Local.with_ymd_and_hms(2023, 10, 8, 22, 15, 25).unwrap();
        let mut schedule = FlushSchedule::new(Duration::from_secs(60), start);

        assert!(!schedule.should_flush(start));
        assert!(!schedule.should_flush(Local.with_ymd_and_hms(2023, 10, 8, 22, 16, 0).unwrap()));
        let due = Local.with_ymd_and_hms(2023, 10, 8, 22, 16, 25).unwrap();
        assert!(schedule.should_flush(due));

        schedule.mark_flushed(due);
        assert!(!schedule.should_flush(Local.with_ymd_and_hms(2023, 10, 8, 22, 17, 0).unwrap()));
        assert!(schedule.should_flush(Local.with_ymd_and_hms(2023, 10, 8, 22, 17, 30).unwrap()));
    }

    #[test]
    fn stop_performs_final_flush() {
        let tracker = Arc::new(LogCostTracker::new(TrackerConfig::default()));
        tracker.track(
            Severity::Info,
            Message::Text("queued"),
            Some(Frame::new(Some("app"), Some("src/main.rs"), 4)),
        );

        let exports = Arc::new(Mutex::new(Vec::new()));
        let sink = DummySink {
            exports: Arc::clone(&exports),
        };
        let interval = Duration::from_secs(3600);
        let handle = Flusher::spawn(Arc::clone(&tracker), Box::new(sink), interval).unwrap();
        handle.stop();

        let exports = exports.lock();
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0], tracker.get_stats());
    }

    #[test]
    fn flushes_periodically() {
        let tracker = Arc::new(LogCostTracker::new(TrackerConfig::default()));
        let exports = Arc::new(Mutex::new(Vec::new()));
        let sink = DummySink {
            exports: Arc::clone(&exports),
        };
        let interval = Duration::from_millis(10);
        let handle = Flusher::spawn(Arc::clone(&tracker), Box::new(sink), interval).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while exports.lock().len() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        drop(handle);

        assert!(exports.lock().len() >= 2);
    }
}
