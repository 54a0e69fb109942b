use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use logcost::analyzer::{self, CostAnalyzer};
use logcost::report;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "logcost", author, version, about = "Analyze log volume stats", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Display the top cost drivers
    Analyze {
        stats_file: PathBuf,
        #[command(flatten)]
        pricing: Pricing,
        /// Entries to display
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Write the stats or their analysis to a file (json, html, csv or prometheus)
    Report {
        stats_file: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        pricing: Pricing,
        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,
        /// Top entries included in a JSON or HTML report
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Estimate the return of reducing log volume
    Estimate {
        stats_file: PathBuf,
        #[command(flatten)]
        pricing: Pricing,
        /// Fraction of volume removed, between 0 and 1
        #[arg(long)]
        reduction: f64,
        /// Hours needed to make the change
        #[arg(long)]
        hours: f64,
        /// Cost of one hour of work
        #[arg(long)]
        rate: f64,
    },
    /// Compare two stats files
    Diff {
        stats_file: PathBuf,
        updated_stats: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct Pricing {
    /// Cloud provider: gcp, aws or azure
    #[arg(long, default_value = "gcp")]
    provider: String,
    #[arg(long, default_value = "USD")]
    currency: String,
    /// Price per GiB, overrides the provider's price
    #[arg(long)]
    price_per_gb: Option<f64>,
}

impl Pricing {
    fn analyzer(&self, stats_file: &Path) -> Result<CostAnalyzer> {
        CostAnalyzer::from_file(stats_file, &self.provider, &self.currency, self.price_per_gb)
            .with_context(|| format!("cannot analyze {}", stats_file.display()))
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Json,
    Html,
    Csv,
    Prometheus,
}

fn write_output(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("cannot write {}", path.display()))
}

fn analyze(stats_file: &Path, pricing: &Pricing, top: usize) -> Result<()> {
    let report = pricing.analyzer(stats_file)?.build_report(top);

    println!(
        "Provider: {}  Currency: {}",
        report.provider.to_uppercase(),
        report.currency
    );
    println!(
        "Total bytes: {}  Estimated cost: {:.2} {}",
        report.total_bytes, report.total_cost, report.currency
    );
    println!();
    println!("Top {} cost drivers:", report.top_entries.len());
    for entry in &report.top_entries {
        let template: String = entry.message_template.chars().take(60).collect();
        println!(
            "- {}:{} [{}] {}... {:.4} {}",
            entry.file, entry.line, entry.level, template, entry.cost, report.currency
        );
    }

    if !report.anti_patterns.is_empty() {
        println!("\nDetected anti-patterns:");
        for pattern in &report.anti_patterns {
            println!("  * {}", pattern);
        }
    }
    println!("\nRecommendations:");
    for tip in &report.recommendations {
        println!("  * {}", tip);
    }
    Ok(())
}

fn write_report(
    stats_file: &Path,
    output: &Path,
    pricing: &Pricing,
    format: Format,
    top: usize,
) -> Result<()> {
    let contents = match format {
        Format::Json => {
            let analysis = pricing.analyzer(stats_file)?.build_report(top);
            report::to_json(&analysis, chrono::Utc::now())?
        }
        Format::Html => report::to_html(&pricing.analyzer(stats_file)?.build_report(top)),
        Format::Csv => report::to_csv(&analyzer::load_stats(stats_file)?),
        Format::Prometheus => report::to_prometheus(&analyzer::load_stats(stats_file)?),
    };
    write_output(output, &contents)?;
    println!("Wrote {:?} report to {}", format, output.display());
    Ok(())
}

fn estimate(
    stats_file: &Path,
    pricing: &Pricing,
    reduction: f64,
    hours: f64,
    rate: f64,
) -> Result<()> {
    let roi = pricing.analyzer(stats_file)?.estimate_roi(reduction, hours, rate)?;
    println!("Potential savings: {:.2}", roi.potential_savings);
    println!("Effort cost: {:.2}", roi.effort_cost);
    println!("Net savings: {:.2}", roi.net_savings);
    println!("ROI: {:.2}", roi.roi);
    Ok(())
}

fn diff(stats_file: &Path, updated_stats: &Path) -> Result<()> {
    let before = analyzer::load_stats(stats_file)?;
    let after = analyzer::load_stats(updated_stats)?;
    let diff = analyzer::diff_stats(&before, &after);

    if diff.is_empty() {
        println!("No differences detected.");
        return Ok(());
    }
    if !diff.added.is_empty() {
        println!("Added statements:");
        for record in &diff.added {
            println!("  + {} bytes={} count={}", record.key(), record.bytes, record.count);
        }
    }
    if !diff.removed.is_empty() {
        println!("\nRemoved statements:");
        for key in &diff.removed {
            println!("  - {}", key);
        }
    }
    if !diff.changed.is_empty() {
        println!("\nChanged statements:");
        for (key, (old, new)) in &diff.changed {
            println!(
                "  * {}: bytes {} -> {}, count {} -> {}",
                key, old.bytes, new.bytes, old.count, new.count
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match &args.command {
        Command::Analyze {
            stats_file,
            pricing,
            top,
        } => analyze(stats_file, pricing, *top),
        Command::Report {
            stats_file,
            output,
            pricing,
            format,
            top,
        } => write_report(stats_file, output, pricing, *format, *top),
        Command::Estimate {
            stats_file,
            pricing,
            reduction,
            hours,
            rate,
        } => estimate(stats_file, pricing, *reduction, *hours, *rate),
        Command::Diff {
            stats_file,
            updated_stats,
        } => diff(stats_file, updated_stats),
    }
}
