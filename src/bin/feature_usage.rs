//! # Feature Usage CLI
//!
//! Command-line tool for recording, querying and maintaining feature usage
//! counters.
//!
//! Usage:
//!   feature-usage record <feature> <agent> [--ip ADDR] [--times N]
//!   feature-usage query <agent> [--start DATE] [--end DATE] [--feature F]... [--format json|table]
//!   feature-usage range
//!   feature-usage purge [--limit N]
//!   feature-usage stats

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use feature_usage::types::{start_of_day, DATE_FORMAT};
use feature_usage::{UsageConfig, UsageEngine, UsageError, UsageReport};
use log::info;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "feature-usage")]
#[command(about = "Record and query deprecated API feature usage", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the SQLite database (overrides the configuration)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record uses of a feature
    Record {
        /// Feature name
        feature: String,

        /// Client agent string
        agent: String,

        /// Client address, used by the insert rate limits
        #[arg(long, default_value = "")]
        ip: String,

        /// Number of events to record
        #[arg(short, long, default_value_t = 1)]
        times: u32,
    },

    /// Show usage for agents starting with a prefix
    Query {
        /// Agent prefix (case-sensitive)
        agent: String,

        /// First day, YYYY-MM-DD
        #[arg(long)]
        start: Option<String>,

        /// Last day, YYYY-MM-DD
        #[arg(long)]
        end: Option<String>,

        /// Restrict to these features
        #[arg(short, long = "feature")]
        features: Vec<String>,

        /// Output format: json, table
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show the suggested default date range
    Range,

    /// Delete expired usage counters
    Purge {
        /// Stop after this many rows
        #[arg(short, long)]
        limit: Option<u64>,
    },

    /// Show store statistics
    Stats,
}

fn main() -> Result<(), String> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    let engine = open_engine(&cli).map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Record {
            feature,
            agent,
            ip,
            times,
        } => {
            for _ in 0..times {
                engine.record(&feature, &agent, &ip);
            }
            engine.flush();
            let stats = engine.stats();
            println!(
                "Recorded {} events: {} counted ({} hits), {} sampled out, {} rate limited",
                stats.events,
                stats.counted,
                stats.hits_credited,
                stats.sampled_out,
                stats.rate_limited
            );
        }

        Commands::Query {
            agent,
            start,
            end,
            features,
            format,
        } => {
            let start = start.as_deref().map(parse_day).transpose()?;
            let end = end.as_deref().map(parse_day).transpose()?;
            let features = if features.is_empty() {
                None
            } else {
                Some(features.as_slice())
            };

            let report = engine
                .query(&agent, start, end, features)
                .map_err(|e| e.to_string())?;

            match format.as_str() {
                "json" => {
                    let json = serde_json::to_string_pretty(&report)
                        .map_err(|e| e.to_string())?;
                    println!("{}", json);
                }
                "table" => print_report_table(&report),
                other => return Err(format!("Unknown format: {}", other)),
            }
        }

        Commands::Range => {
            let (start, end) = engine.suggest_date_range().map_err(|e| e.to_string())?;
            println!("Start: {}", start.to_rfc3339());
            println!("End:   {}", end.to_rfc3339());
        }

        Commands::Purge { limit } => {
            println!("Deleting expired records");
            let mut progress = PurgeProgress::new();
            let mut report = |percent: f64| {
                if let Some(line) = progress.observe(percent) {
                    println!("{}", line);
                }
            };

            let deleted = engine
                .prune(Some(&mut report), limit)
                .map_err(|e| e.to_string())?;
            if let Some(line) = progress.observe(100.0) {
                println!("{}", line);
            }
            info!("purge removed {} rows", deleted);
            println!("\nDone");
        }

        Commands::Stats => {
            let store = engine.store();
            let rows = store.total_rows().map_err(|e| e.to_string())?;
            let config = engine.config();
            let (start, _) = engine.suggest_date_range().map_err(|e| e.to_string())?;

            println!("Feature usage store:\n");
            println!("  Database:        {}", config.storage.database_path.display());
            println!("  Counter rows:    {}", rows);
            println!("  Earliest day:    {}", start.format(DATE_FORMAT));
            println!("  Retention:       {} days", config.retention.max_age_days);
            println!(
                "  Sampling:        {} (ratio {}, factor {}..={})",
                if config.sampling.enabled { "on" } else { "off" },
                config.sampling.ratio,
                config.sampling.min_factor,
                config.sampling.max_factor
            );
        }
    }

    Ok(())
}

fn open_engine(cli: &Cli) -> Result<UsageEngine, UsageError> {
    let mut config = match &cli.config {
        Some(path) => UsageConfig::load(path)?,
        None => {
            let mut config = UsageConfig::default();
            config.apply_env()?;
            config
        }
    };
    if let Some(db) = &cli.db {
        config.storage.database_path = db.clone();
    }
    UsageEngine::open(config)
}

fn parse_day(raw: &str) -> Result<DateTime<Utc>, String> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map(start_of_day)
        .map_err(|e| format!("Invalid date '{}': {}", raw, e))
}

fn print_report_table(report: &UsageReport) {
    println!(
        "Usage for agents starting with '{}' ({} .. {}):\n",
        report.agent, report.start, report.end
    );
    if report.usage.is_empty() {
        println!("  No usage recorded");
        return;
    }

    println!("  {:<12} {:<40} {:>10}", "DATE", "FEATURE", "COUNT");
    for row in &report.usage {
        println!("  {:<12} {:<40} {:>10}", row.date, row.feature, row.count);
    }
    let total: u64 = report.usage.iter().map(|row| row.count).sum();
    println!("\n  Total: {}", total);
}

/// Throttles purge progress output to one line per 0.1% step.
struct PurgeProgress {
    last_progress: Option<String>,
    last_printed: Instant,
    calls: u64,
}

impl PurgeProgress {
    fn new() -> Self {
        PurgeProgress {
            last_progress: None,
            last_printed: Instant::now(),
            calls: 0,
        }
    }

    fn observe(&mut self, percent: f64) -> Option<String> {
        self.calls += 1;

        let progress = format!("{:.1}", percent);
        if self.last_progress.as_deref() == Some(progress.as_str()) {
            return None;
        }

        let now = Instant::now();
        let line = format!(
            "... {}% done (+{} iterations in {:.1}s)",
            progress,
            self.calls,
            now.duration_since(self.last_printed).as_secs_f64()
        );

        self.last_progress = Some(progress);
        self.last_printed = now;
        self.calls = 0;
        Some(line)
    }
}
