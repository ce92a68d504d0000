//! CLI entry point for the traffic ingest job.
//!
//! Provides subcommands for scheduled collection into a database, a one-off
//! snapshot to disk, database statistics, and an interactive mode picker.

use anyhow::{Context, Result, bail};
use chrono::{TimeDelta, Utc};
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use traffic_ingest::{
    config::{DEFAULT_INTERVAL_MINUTES, DbConfig, PipelineSettings, RunMode},
    fetch::{ApiKey, BasicClient, DEFAULT_FETCH_LIMIT, DEFAULT_SOURCE_URL, HttpClient, fetch_records},
    output::{CongestionReport, DatabaseReport, SnapshotFormat, SummaryReport, print_json, write_snapshot},
    pipeline::Pipeline,
    record::normalize,
    stats::StatisticsSummary,
    store::{ConflictPolicy, PgConnector, SqliteConnector, StatsQuery, StoreConnector, read_statistics},
};

#[derive(Parser)]
#[command(name = "traffic_ingest")]
#[command(about = "Collects real-time traffic speed data into a database", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, store and report, once or on an interval
    Collect {
        #[command(flatten)]
        collect: CollectArgs,

        /// Run a single cycle and exit
        #[arg(long, default_value_t = false)]
        once: bool,

        /// Minutes between cycles in continuous mode
        #[arg(short, long, env = "INTERVAL_MINUTES", default_value_t = DEFAULT_INTERVAL_MINUTES)]
        interval_minutes: u64,
    },
    /// Pick the run mode from an interactive menu
    Menu {
        #[command(flatten)]
        collect: CollectArgs,
    },
    /// Fetch one batch, print a summary and save it to a file
    Snapshot {
        #[command(flatten)]
        source: SourceArgs,

        /// Directory to write the snapshot into
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        #[arg(short, long, value_enum, default_value_t = SnapshotFormat::Json)]
        format: SnapshotFormat,
    },
    /// Print statistics over the stored data
    Stats {
        #[command(flatten)]
        store: StoreArgs,

        /// Trailing window for speed statistics, in minutes
        #[arg(long, default_value_t = 60)]
        window_minutes: i64,

        /// Number of most congested links to list
        #[arg(long, default_value_t = 5)]
        top: i64,

        /// Print as JSON instead of a text report
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Traffic feed endpoint
    #[arg(long, env = "TRAFFIC_SOURCE_URL", default_value = DEFAULT_SOURCE_URL)]
    source_url: String,

    /// Optional Socrata application token
    #[arg(long, env = "SOCRATA_APP_TOKEN", hide_env_values = true)]
    app_token: Option<String>,

    /// Maximum number of records per fetch
    #[arg(short, long, env = "FETCH_LIMIT", default_value_t = DEFAULT_FETCH_LIMIT)]
    limit: u32,

    /// Time zone of feed timestamps that carry no UTC offset
    #[arg(long, env = "SOURCE_TZ", default_value = "America/New_York")]
    source_tz: Tz,

    /// Speed (mph) below which a segment counts as congested
    #[arg(long, env = "SPEED_THRESHOLD", default_value_t = 15.0)]
    speed_threshold: f64,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Postgres,
    Sqlite,
}

#[derive(Args)]
struct StoreArgs {
    #[arg(long, env = "DB_BACKEND", value_enum, default_value_t = Backend::Postgres)]
    backend: Backend,

    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    db_host: String,

    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    db_port: u16,

    #[arg(long, env = "DB_NAME", default_value = "traffic_db")]
    db_name: String,

    #[arg(long, env = "DB_USER", default_value = "traffic_user")]
    db_user: String,

    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,

    /// Database file for the SQLite backend
    #[arg(long, env = "SQLITE_PATH", default_value = "traffic.db")]
    sqlite_path: PathBuf,

    /// What to do when a (link, timestamp) row already exists
    #[arg(long, env = "ON_CONFLICT", value_enum, default_value_t = ConflictPolicy::Update)]
    on_conflict: ConflictPolicy,
}

impl StoreArgs {
    fn db_config(&self) -> DbConfig {
        DbConfig {
            host: self.db_host.clone(),
            port: self.db_port,
            database: self.db_name.clone(),
            user: self.db_user.clone(),
            password: self.db_password.clone(),
        }
    }
}

#[derive(Args)]
struct CollectArgs {
    #[command(flatten)]
    source: SourceArgs,

    #[command(flatten)]
    store: StoreArgs,

    /// Create the traffic_data table if it does not exist
    #[arg(long, default_value_t = false)]
    init_schema: bool,

    /// CSV file to append each cycle's summary to
    #[arg(long)]
    summary_csv: Option<String>,
}

impl CollectArgs {
    fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            source_url: self.source.source_url.clone(),
            fetch_limit: self.source.limit,
            source_tz: self.source.source_tz,
            speed_threshold: self.source.speed_threshold,
            init_schema: self.init_schema,
            summary_csv: self.summary_csv.clone(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/traffic_ingest.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("traffic_ingest.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive(LevelFilter::INFO.into()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive(LevelFilter::DEBUG.into()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Collect {
            collect,
            once,
            interval_minutes,
        } => {
            let mode = if once {
                RunMode::Single
            } else {
                RunMode::every_minutes(interval_minutes)
            };
            collect_with_backend(&collect, mode).await?;
        }
        Commands::Menu { collect } => {
            let mode = prompt_run_mode().await?;
            collect_with_backend(&collect, mode).await?;
        }
        Commands::Snapshot {
            source,
            output_dir,
            format,
        } => {
            snapshot(&source, &output_dir, format).await?;
        }
        Commands::Stats {
            store,
            window_minutes,
            top,
            json,
        } => {
            let query = StatsQuery {
                window: TimeDelta::minutes(window_minutes),
                top_n: top,
            };
            match store.backend {
                Backend::Postgres => {
                    let connector = PgConnector::new(&store.db_config(), store.on_conflict);
                    print_stats(&connector, query, json).await?;
                }
                Backend::Sqlite => {
                    let connector = SqliteConnector::new(&store.sqlite_path, store.on_conflict);
                    print_stats(&connector, query, json).await?;
                }
            }
        }
    }

    Ok(())
}

/// Builds the feed client, adding the app token header when one is configured.
fn build_client(source: &SourceArgs) -> Result<Box<dyn HttpClient>> {
    let basic = BasicClient::new().context("building HTTP client")?;
    let client: Box<dyn HttpClient> = match &source.app_token {
        Some(token) => Box::new(ApiKey::app_token(basic, token)?),
        None => Box::new(basic),
    };
    Ok(client)
}

async fn collect_with_backend(args: &CollectArgs, mode: RunMode) -> Result<()> {
    let client = build_client(&args.source)?;
    let store = &args.store;

    match store.backend {
        Backend::Postgres => {
            let connector = PgConnector::new(&store.db_config(), store.on_conflict);
            collect(Pipeline::new(client, connector, args.settings()), mode).await
        }
        Backend::Sqlite => {
            let connector = SqliteConnector::new(&store.sqlite_path, store.on_conflict);
            collect(Pipeline::new(client, connector, args.settings()), mode).await
        }
    }
}

async fn collect<C: HttpClient, S: StoreConnector>(
    pipeline: Pipeline<C, S>,
    mode: RunMode,
) -> Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stop requested, finishing current cycle");
            let _ = stop_tx.send(true);
        }
    });

    let cycles = pipeline.run(mode, stop_rx).await?;
    println!("Total cycles completed: {cycles}");
    Ok(())
}

async fn prompt_run_mode() -> Result<RunMode> {
    println!("Options:");
    println!("1. Run single collection");
    println!("2. Run continuous collection (every 5 minutes)");
    println!("3. Run continuous collection (every 10 minutes)");
    println!("4. Run continuous collection (every 1 minute - for testing)");
    println!();
    println!("Enter choice (1/2/3/4):");

    let mut choice = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut choice)
        .await?;

    let mode = RunMode::from_menu_choice(&choice);
    if mode == RunMode::Single && choice.trim() != "1" {
        println!("Invalid choice. Running single collection...");
    }
    Ok(mode)
}

async fn snapshot(source: &SourceArgs, output_dir: &Path, format: SnapshotFormat) -> Result<()> {
    let client = build_client(source)?;

    let raw = match fetch_records(&client, &source.source_url, source.limit).await {
        Ok(raw) => raw,
        Err(e) => {
            error!(error = %e, "Failed to fetch traffic data");
            bail!(e);
        }
    };
    info!(fetched = raw.len(), "Successfully fetched traffic segments");

    let taken_at = Utc::now();
    let records = normalize(&raw, taken_at, source.source_tz);
    let summary = StatisticsSummary::from_records(&records);

    println!(
        "{}",
        SummaryReport {
            records: &records,
            summary: &summary,
        }
    );
    println!(
        "{}",
        CongestionReport {
            records: &records,
            threshold: source.speed_threshold,
        }
    );

    let path = write_snapshot(output_dir, &records, format, taken_at)?;
    info!(path = %path.display(), "Data saved");
    Ok(())
}

async fn print_stats<S: StoreConnector>(connector: &S, query: StatsQuery, json: bool) -> Result<()> {
    let stats = read_statistics(connector, query).await?;

    if json {
        print_json(&stats)?;
    } else {
        println!("{}", DatabaseReport(&stats));
    }
    Ok(())
}
