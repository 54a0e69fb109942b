extern crate logcost;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use logcost::config::TrackerConfig;
use logcost::{FileSink, Flusher, LogCostTracker};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stats file rewritten on every flush
    #[arg(short, long)]
    output: PathBuf,

    /// Milliseconds between flushes
    #[arg(short, long, default_value_t = 500)]
    interval: u64,

    /// Rotate the stats file once it reaches this many bytes
    #[arg(long)]
    max_file_size: Option<u64>,
}

fn main() {
    let args = Args::parse();

    let tracker = Arc::new(LogCostTracker::new(TrackerConfig::default()));
    tracing_subscriber::registry()
        .with(tracker.layer())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let sink = FileSink::new(&args.output).with_rotation(args.max_file_size, 3);
    let flusher = Flusher::spawn(
        Arc::clone(&tracker),
        Box::new(sink),
        Duration::from_millis(args.interval),
    )
    .unwrap();

    for batch in 0..20 {
        tracing::info!(batch, "batch started");
        thread::sleep(Duration::from_millis(args.interval / 4));
        tracing::info!(batch, "batch finished");
    }

    flusher.stop();
    tracing::info!(sites = tracker.get_stats().len(), "final stats flushed");
}
