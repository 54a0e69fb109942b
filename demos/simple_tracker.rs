extern crate logcost;

use std::path::PathBuf;

use clap::Parser;
use logcost::{println, Severity};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Where the stats are exported
    #[arg(short, long)]
    output: PathBuf,

    /// Orders processed by the demo loop
    #[arg(short, long, default_value_t = 100)]
    iterations: u32,
}

mod helpers {
    #[inline(never)]
    pub fn audit(order: u32) {
        tracing::info!(order, "audit entry written");
    }
}

fn main() {
    let args = Args::parse();

    logcost::install();
    logcost::ignore_module("simple_tracker::helpers");

    for order in 0..args.iterations {
        tracing::info!(order, "order submitted");
        if order % 10 == 0 {
            tracing::warn!(order, "order flagged for review");
        }
        helpers::audit(order);
    }
    println!("processed {} orders", args.iterations);

    let path = logcost::export(Some(&args.output)).unwrap();
    for record in logcost::get_stats().values() {
        if record.level != Severity::Print {
            tracing::info!(
                "{}:{} {} count={} bytes={}",
                record.file,
                record.line,
                record.level,
                record.count,
                record.bytes
            );
        }
    }
    tracing::info!(path = %path.display(), "stats exported");
}
