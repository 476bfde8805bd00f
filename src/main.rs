mod archive;
mod db;
mod error;
mod feed;
mod fetcher;
mod model;
mod pipeline;
mod query;
mod settings;
mod transform;

use std::time::Instant;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use archive::Archive;
use feed::HttpFeed;
use fetcher::FetchOptions;
use pipeline::{Pipeline, RunReport};
use query::IntervalStats;
use settings::Settings;
use transform::{TransformStop, Transformer};

#[derive(Parser)]
#[command(name = "event_harvester", about = "Harvest a public event feed into a deduplicated store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new pages and transform them, once
    Run {
        /// Max feed pages to fetch this run
        #[arg(short = 'n', long)]
        max_pages: Option<usize>,
    },
    /// Run the pipeline on a fixed interval until Ctrl-C
    Watch {
        /// Seconds between runs
        #[arg(short, long)]
        interval: Option<u64>,
        /// Max feed pages per run
        #[arg(short = 'n', long)]
        max_pages: Option<usize>,
    },
    /// Re-transform every archived page (already stored ids are skipped)
    Reprocess,
    /// Record counts per kind over a trailing window
    Counts {
        /// Window size in minutes
        #[arg(short, long, default_value = "10")]
        minutes: i64,
    },
    /// Most active subjects over a trailing window
    Active {
        #[arg(short, long, default_value = "60")]
        minutes: i64,
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Average time between records of one kind for a subject
    AvgInterval {
        /// Subject name, e.g. "owner/repo"
        subject: String,
        #[arg(short, long, default_value = "PullRequestEvent")]
        kind: String,
    },
    /// Subjects with more than one record of a kind
    Repeated {
        #[arg(short, long, default_value = "PullRequestEvent")]
        kind: String,
    },
    /// Store totals and recent runs
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load()?;

    let conn = db::connect(&settings.db_path(), settings.busy_timeout())
        .with_context(|| format!("Failed to open {:?}", settings.db_path()))?;
    db::init_schema(&conn)?;

    let result = match cli.command {
        Commands::Run { max_pages } => {
            if let Some(n) = max_pages {
                settings.max_pages = n;
            }
            let pipeline = build_pipeline(&settings, conn)?;
            let report = pipeline.run(&shutdown_token()).await;
            print_report(&report);
            Ok(())
        }
        Commands::Watch { interval, max_pages } => {
            if let Some(n) = max_pages {
                settings.max_pages = n;
            }
            if let Some(secs) = interval {
                settings.interval_secs = secs;
            }
            let pipeline = build_pipeline(&settings, conn)?;
            let runs = pipeline::watch(&pipeline, settings.interval(), &shutdown_token()).await;
            println!("Stopped after {} runs.", runs);
            Ok(())
        }
        Commands::Reprocess => {
            let archive = Archive::open(settings.archive_dir())?;
            let refs = archive.list()?;
            if refs.is_empty() {
                println!("Archive at {:?} is empty. Run 'run' first.", archive.dir());
                return Ok(());
            }
            println!("Reprocessing {} archived pages...", refs.len());

            let pb = ProgressBar::new(refs.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
                    .progress_chars("=> "),
            );
            let transformer = Transformer::from_settings(&settings);
            let report = transformer.transform_pages(&conn, &archive, &refs, &shutdown_token(), &pb);
            pb.finish_and_clear();

            let (filtered, invalid, duplicates) = report.pages.iter().fold((0, 0, 0), |acc, p| {
                (acc.0 + p.filtered, acc.1 + p.invalid, acc.2 + p.duplicates)
            });
            println!(
                "Inserted {} records from {} pages ({} filtered, {} invalid, {} duplicates, {} unreadable pages).",
                report.inserted(),
                report.pages.len(),
                filtered,
                invalid,
                duplicates,
                report.unreadable,
            );
            match report.stopped {
                Some(TransformStop::Storage(e)) => Err(e.into()),
                Some(TransformStop::Cancelled) => {
                    println!("Interrupted; rerun to continue.");
                    Ok(())
                }
                None => Ok(()),
            }
        }
        Commands::Counts { minutes } => {
            let since = Utc::now() - ChronoDuration::minutes(minutes);
            let rows = query::count_by_kind(&conn, since)?;
            if rows.is_empty() {
                println!("No records in the last {} minutes.", minutes);
                return Ok(());
            }
            println!("{:<28} | {:>7}", "Kind", "Count");
            println!("{}", "-".repeat(38));
            for r in &rows {
                println!("{:<28} | {:>7}", truncate(&r.kind, 28), r.count);
            }
            Ok(())
        }
        Commands::Active { minutes, limit } => {
            let since = Utc::now() - ChronoDuration::minutes(minutes);
            let rows = query::top_subjects(&conn, since, limit)?;
            if rows.is_empty() {
                println!("No active subjects in the last {} minutes.", minutes);
                return Ok(());
            }
            println!("{:>3} | {:<40} | {:>7}", "#", "Subject", "Records");
            println!("{}", "-".repeat(56));
            for (i, r) in rows.iter().enumerate() {
                println!("{:>3} | {:<40} | {:>7}", i + 1, truncate(&r.subject, 40), r.count);
            }
            Ok(())
        }
        Commands::AvgInterval { subject, kind } => {
            match query::average_interval(&conn, &subject, &kind)? {
                IntervalStats::Average { seconds, count } => {
                    println!("{} ({} x {})", subject, count, kind);
                    println!("  average: {:.1}s", seconds);
                    println!("           {:.2}m", seconds / 60.0);
                    println!("           {:.2}h", seconds / 3600.0);
                }
                IntervalStats::InsufficientData { count } => {
                    println!(
                        "Not enough {} records for {} (found {}, need 2).",
                        kind, subject, count
                    );
                }
            }
            Ok(())
        }
        Commands::Repeated { kind } => {
            let rows = query::repeated_subjects(&conn, &kind)?;
            if rows.is_empty() {
                println!("No subject has more than one {}.", kind);
                return Ok(());
            }
            for r in &rows {
                println!("{:>5}  {}", r.count, r.subject);
            }
            println!("\n{} subjects", rows.len());
            Ok(())
        }
        Commands::Stats => {
            let total = db::count_events(&conn)?;
            let archived = Archive::open(settings.archive_dir())?.list()?.len();
            println!("Records:        {}", total);
            println!("Archived pages: {}", archived);
            for k in query::count_by_kind(&conn, chrono::DateTime::<Utc>::default())? {
                println!("  {:<24} {}", k.kind, k.count);
            }

            let runs = db::recent_runs(&conn, 10)?;
            if !runs.is_empty() {
                println!("\n--- Recent runs ---");
                for r in &runs {
                    println!(
                        "  {} | {:>6}ms | {:>3} pages | {:>5} new | {} ({})",
                        r.started_at, r.elapsed_ms, r.pages_fetched, r.records_inserted, r.outcome, r.stop_reason
                    );
                }
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn build_pipeline(settings: &Settings, conn: rusqlite::Connection) -> anyhow::Result<Pipeline<HttpFeed>> {
    let feed = HttpFeed::new(settings.token.as_deref(), settings.request_timeout())?;
    let archive = Archive::open(settings.archive_dir())?;
    let fetch = FetchOptions::from_settings(settings)?;
    info!(
        feed = %fetch.start_url,
        max_pages = fetch.max_pages,
        kinds = ?settings.kinds,
        "Pipeline configured"
    );
    Ok(Pipeline::new(feed, archive, conn, Transformer::from_settings(settings), fetch))
}

/// Token cancelled on Ctrl-C; in-flight work stops at the next page boundary.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing current page");
            on_signal.cancel();
        }
    });
    cancel
}

fn print_report(report: &RunReport) {
    let stop = report.stop.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "-".into());
    println!(
        "Run {}: {} pages, {} new records, {} (fetch stop: {}) in {}",
        report.run_id,
        report.pages_fetched,
        report.records_inserted,
        report.outcome,
        stop,
        format_duration(report.elapsed),
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
