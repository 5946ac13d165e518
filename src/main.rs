//! CLI entry point for the transit grid relay.
//!
//! `serve` exposes the pipeline over HTTP; `snapshot` runs a single pass from
//! the command line; `decode` buckets a captured feed without publishing.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use transit_grid_relay::{
    api::{self, AppState},
    broker::{BrokerPublisher, Connector, amqp::AmqpConnector, memory::MemoryBroker},
    config::Settings,
    fetch::{BasicClient, FeedFetcher, auth::ApiKey, fetch_bytes},
    grid::bucket,
    output::{print_pretty, render_json, render_stats_json, write_snapshot},
    parser::decode_vehicles,
    pipeline::Pipeline,
};

#[derive(Parser)]
#[command(name = "transit_grid_relay")]
#[command(about = "Buckets live vehicle positions into a grid and relays them to a broker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve GET /api/vehicle-positions
    Serve {
        /// Address to listen on (overrides BIND_ADDR)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Run one fetch/bucket/publish pass and print the result
    Snapshot {
        /// Write the bucket map to this file instead of stdout
        #[arg(short, long)]
        output: Option<String>,

        /// Skip the broker entirely
        #[arg(long, default_value_t = false)]
        no_publish: bool,

        /// Publish to an in-memory broker and report what would be sent
        #[arg(long, default_value_t = false, conflicts_with = "no_publish")]
        dry_run: bool,

        /// Also print the pass statistics as JSON on stderr
        #[arg(long, default_value_t = false)]
        stats: bool,
    },
    /// Decode and bucket a GTFS-RT feed from a file or URL
    Decode {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/transit_grid_relay.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("transit_grid_relay.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Serve { bind } => {
            serve(&settings, bind).await?;
        }
        Commands::Snapshot {
            output,
            no_publish,
            dry_run,
            stats: stats_json,
        } => {
            let memory = MemoryBroker::new();
            let pipeline = if dry_run {
                build_pipeline(&settings, memory.clone())
            } else {
                build_pipeline(&settings, AmqpConnector::new(settings.broker.clone()))
            };

            let (buckets, stats) = if no_publish {
                pipeline.collect().await
            } else {
                let report = pipeline.run_pass().await;
                pipeline.publisher().close().await;
                (report.buckets, report.stats)
            };
            print_pretty(&stats);
            if stats_json {
                eprintln!("{}", render_stats_json(&stats)?);
            }

            if dry_run {
                for message in memory.messages() {
                    info!(
                        topic = %message.topic,
                        bytes = message.payload.len(),
                        "Dry run: would publish"
                    );
                }
            }

            match output {
                Some(path) => write_snapshot(&path, &buckets)?,
                None => println!("{}", render_json(&buckets, true)?),
            }
        }
        Commands::Decode { source } => {
            let bytes = fetcher(&source).await?;
            let records = decode_vehicles(&bytes)?;
            info!(vehicles = records.len(), "Feed decoded");
            let buckets = bucket(records);
            println!("{}", render_json(&buckets, true)?);
        }
    }

    Ok(())
}

/// Wires the upstream fetcher and a broker publisher into a [`Pipeline`].
/// Nothing is validated here; bad settings show up on the first pass.
fn build_pipeline(settings: &Settings, connector: impl Connector + 'static) -> Pipeline {
    let client = ApiKey::subscription_key(BasicClient::new(), &settings.api_key);
    let fetcher = FeedFetcher::new(client, settings.vehicle_positions_url.clone());
    Pipeline::new(fetcher, Arc::new(BrokerPublisher::new(connector)))
}

/// Runs the HTTP server until Ctrl+C, then closes the broker connection.
#[tracing::instrument(skip(settings))]
async fn serve(settings: &Settings, bind: Option<String>) -> Result<()> {
    let pipeline = Arc::new(build_pipeline(
        settings,
        AmqpConnector::new(settings.broker.clone()),
    ));

    // Connect up front so the first request does not pay for it. A failure
    // here is retried on the first publish.
    if let Err(e) = pipeline.publisher().ensure_connected().await {
        warn!(error = %e, "Broker unavailable at startup");
    }

    let app = api::router(
        AppState {
            pipeline: Arc::clone(&pipeline),
        },
        &settings.cors_origin,
    );

    let addr: SocketAddr = match bind {
        Some(bind) => bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid bind address {bind}"))?,
        None => settings
            .socket_addr()
            .with_context(|| format!("Invalid BIND_ADDR {}", settings.bind_addr))?,
    };
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        })
        .await?;

    pipeline.publisher().close().await;
    info!("Server stopped");
    Ok(())
}

/// Loads feed data from a local file path or fetches it over HTTP.
#[tracing::instrument(fields(source = %url))]
async fn fetcher(url: &str) -> Result<Vec<u8>> {
    let bytes = if url.starts_with("http") {
        let client = BasicClient::new();
        fetch_bytes(&client, url).await?
    } else {
        std::fs::read(url).with_context(|| format!("Failed to read {url}"))?
    };
    Ok(bytes)
}
