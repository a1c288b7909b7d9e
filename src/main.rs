//! CLI entry point for the metro delay pipeline.
//!
//! Each subcommand is one scheduled job: resolving the static schedule,
//! capturing realtime feeds, aggregating finished hours, extracting features,
//! the live delay ingest, and archiving a day's aggregates to S3.

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use metro_delay::aggregate::aggregate_hour;
use metro_delay::config::PipelineConfig;
use metro_delay::fetch::TokioSleeper;
use metro_delay::layout::HourKey;
use metro_delay::model::FeedKind;
use metro_delay::pipeline::{
    aggregate_pending, capture, download_static, extract_hour, ingest_live, realtime_client,
    resolve_static, run, trip_lines_for,
};
use metro_delay::upload::upload_day;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "metro_delay")]
#[command(about = "Collects metro realtime feeds and builds per-line delay features", long_about = None)]
struct Cli {
    /// JSON pipeline settings; defaults are used when omitted
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve relevant ids from an extracted static schedule
    ResolveStatic {
        /// Directory holding the GTFS .txt tables (default: today's static dir)
        #[arg(short, long)]
        static_dir: Option<PathBuf>,
    },
    /// Download today's static schedule archive
    DownloadStatic,
    /// Capture one message of each realtime feed
    Capture,
    /// Aggregate captured hours into hourly files
    Aggregate {
        /// Local date of a single hour to aggregate (default: all pending hours)
        #[arg(long, requires = "hour")]
        date: Option<NaiveDate>,

        /// Local hour (0-23) of a single hour to aggregate
        #[arg(long, requires = "date")]
        hour: Option<u32>,

        /// Restrict a single-hour run to one feed
        #[arg(long, value_enum)]
        feed: Option<FeedKind>,

        #[arg(short, long)]
        static_dir: Option<PathBuf>,
    },
    /// Extract features and labels of one aggregated hour
    Extract {
        #[arg(long)]
        date: NaiveDate,

        #[arg(long)]
        hour: u32,

        #[arg(short, long)]
        static_dir: Option<PathBuf>,
    },
    /// Fetch trip updates and append the live delay label and lagged features
    Ingest {
        #[arg(short, long)]
        static_dir: Option<PathBuf>,
    },
    /// Capture, aggregate, extract and ingest in one invocation
    Run {
        #[arg(short, long)]
        static_dir: Option<PathBuf>,
    },
    /// Upload a day's hourly aggregates to S3
    Upload {
        /// Local date to upload (default: yesterday)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// S3 bucket name to upload to (e.g., "my-bucket")
        #[arg(long)]
        s3_bucket: String,

        /// Gzip compress files before uploading
        #[arg(long, default_value_t = false)]
        gzip: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    let _log_guard = init_tracing()?;

    let cli = Cli::parse();
    let config = PipelineConfig::load_or_default(cli.config.as_deref())?;
    let now = Utc::now();
    let today = local_date(&config, now);

    match cli.command {
        Commands::ResolveStatic { static_dir } => {
            let dir = static_dir.unwrap_or_else(|| config.layout().static_dir(today));
            resolve_static(&config, &dir, today)?;
        }
        Commands::DownloadStatic => {
            download_static(&config, &TokioSleeper, today).await?;
        }
        Commands::Capture => {
            let client = realtime_client(&config)?;
            capture(&config, &client, &TokioSleeper, now).await?;
        }
        Commands::Aggregate {
            date,
            hour,
            feed,
            static_dir,
        } => {
            let trip_lines = trip_lines_for(&config, static_dir.as_deref(), today)?;
            match (date, hour) {
                (Some(date), Some(hour)) => {
                    if hour > 23 {
                        bail!("hour must be between 0 and 23, got {hour}");
                    }
                    let feeds = match feed {
                        Some(feed) => vec![feed],
                        None => vec![FeedKind::VehiclePositions, FeedKind::TripUpdates],
                    };
                    for feed in feeds {
                        let key = HourKey::new(date, hour, feed);
                        let outcome =
                            aggregate_hour(&config.layout(), key, &trip_lines, config.timezone)?;
                        info!(feed = %feed, ?outcome, "Aggregation finished");
                    }
                }
                _ => {
                    let outcomes = aggregate_pending(&config, &trip_lines, now)?;
                    info!(hours = outcomes.len(), "Pending hours aggregated");
                }
            }
        }
        Commands::Extract {
            date,
            hour,
            static_dir,
        } => {
            let trip_lines = trip_lines_for(&config, static_dir.as_deref(), today)?;
            extract_hour(&config, &trip_lines, date, hour)?;
        }
        Commands::Ingest { static_dir } => {
            let trip_lines = trip_lines_for(&config, static_dir.as_deref(), today)?;
            let client = realtime_client(&config)?;
            ingest_live(&config, &client, &TokioSleeper, &trip_lines, now).await?;
        }
        Commands::Run { static_dir } => {
            let trip_lines = trip_lines_for(&config, static_dir.as_deref(), today)?;
            let client = realtime_client(&config)?;
            run(&config, &client, &TokioSleeper, &trip_lines, now).await?;
        }
        Commands::Upload {
            date,
            s3_bucket,
            gzip,
        } => {
            if s3_bucket.is_empty() {
                info!("S3 bucket not specified, skipping upload");
                return Ok(());
            }
            let Some(date) = date.or_else(|| today.pred_opt()) else {
                bail!("no day before {today}");
            };
            let aws = aws_config::load_from_env().await;
            let client = aws_sdk_s3::Client::new(&aws);
            upload_day(&client, &s3_bucket, &config.layout(), date, gzip).await?;
        }
    }

    Ok(())
}

/// Calendar date of `now` in the configured time zone.
fn local_date(config: &PipelineConfig, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&config.timezone).date_naive()
}

/// Coloured stderr output filtered by `RUST_LOG`, plus JSON lines in a daily
/// rolling file (`LOG_FILE_PATH`) filtered by `RUST_LOG_JSON`. The returned
/// guard flushes the file writer on drop.
fn init_tracing() -> Result<WorkerGuard> {
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/metro_delay.log".to_string());
    let log_path = Path::new(&log_file_path);
    let appender = tracing_appender::rolling::daily(
        log_path.parent().unwrap_or(Path::new("logs")),
        log_path.file_name().unwrap_or(OsStr::new("metro_delay.log")),
    );
    let (json_writer, guard) = tracing_appender::non_blocking(appender);

    let console = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(json_writer)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry().with(console).with(json).init();
    Ok(guard)
}
