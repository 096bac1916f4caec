mod config;
mod replay;
mod ws_transport;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::StatlineConfig;
use replay::ReplaySource;
use serde::Serialize;
use statline_aggregate::{selectors, DateRange, Granularity};
use statline_core::{CategoryId, CategoryScope, Record};
use statline_storage::StoreRegistry;
use statline_sync::{
    spawn_coordinator, sync_with_retry, ActivityService, ChannelTransport, IngestionCoordinator,
    MessageBus, SyncEvent, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ws_transport::WsTransport;

#[derive(Parser, Debug)]
#[command(name = "statline")]
#[command(about = "Sync game activity records and chart them", long_about = None)]
struct Cli {
    /// Config file (defaults to $STATLINE_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the SQLite stores
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,
    #[arg(long, global = true, default_value = "activity")]
    store: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pull records for a time range into the local store
    Sync {
        #[arg(long, default_value = "activity")]
        stream: String,
        #[arg(long = "category")]
        categories: Vec<CategoryId>,
        #[arg(long)]
        from: i64,
        #[arg(long)]
        to: i64,
        /// Answer the request from an NDJSON fixture instead of the source
        #[arg(long)]
        replay: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
    },
    /// Aggregate stored records into a time series
    Series {
        #[arg(long)]
        category: CategoryId,
        #[arg(long, default_value = "day")]
        granularity: Granularity,
        /// Numeric payload field to sum; counts records when omitted
        #[arg(long)]
        field: Option<String>,
        #[arg(long)]
        from: Option<i64>,
        #[arg(long)]
        to: Option<i64>,
        #[arg(long)]
        date_from: Option<String>,
        #[arg(long)]
        date_to: Option<String>,
    },
    /// Record counts per category
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut settings = StatlineConfig::load(cli.config.as_deref(), |key| std::env::var(key).ok())
        .context("failed to load configuration")?;
    if let Some(dir) = cli.store_dir.clone() {
        settings.store_dir = Some(dir);
    }
    let registry = StoreRegistry::new(settings.store_dir());

    let result = match cli.command {
        Commands::Sync {
            stream,
            categories,
            from,
            to,
            replay,
            url,
        } => {
            if let Some(url) = url {
                settings.source_url = url;
            }
            let request = SyncArgs {
                stream,
                scope: CategoryScope::only(categories),
                from,
                to,
                replay,
            };
            run_sync(&settings, &registry, &cli.store, request).await
        }
        Commands::Series {
            category,
            granularity,
            field,
            from,
            to,
            date_from,
            date_to,
        } => {
            let window = match (from, to) {
                (Some(from), Some(to)) => Some((from, to)),
                (None, None) => None,
                _ => bail!("--from and --to must be given together"),
            };
            let request = SeriesArgs {
                category,
                window,
                granularity,
                field,
                range: DateRange::new(date_from.as_deref(), date_to.as_deref()),
            };
            run_series(&settings, &registry, &cli.store, request)
        }
        Commands::Stats => run_stats(&registry, &cli.store),
    };

    if let Err(err) = &result {
        error!(event = "command_failed", error = %err);
    }
    result
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("STATLINE_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

struct SyncArgs {
    stream: String,
    scope: CategoryScope,
    from: i64,
    to: i64,
    replay: Option<PathBuf>,
}

async fn run_sync(
    settings: &StatlineConfig,
    registry: &StoreRegistry,
    store_name: &str,
    args: SyncArgs,
) -> Result<()> {
    let store = registry
        .open(store_name)
        .with_context(|| format!("failed to open store '{store_name}'"))?;
    let bus = MessageBus::new();

    let (transport, pump) = match &args.replay {
        Some(path) => {
            let source = ReplaySource::load(path).await?;
            let (transport, requests) = ChannelTransport::new();
            let pump = source.spawn(requests, bus.clone());
            let transport: Arc<dyn Transport> = Arc::new(transport);
            (transport, pump)
        }
        None => {
            let url = settings.source_url()?;
            let (transport, pump) = WsTransport::connect(&url, bus.clone()).await?;
            let transport: Arc<dyn Transport> = Arc::new(transport);
            (transport, pump)
        }
    };

    let coordinator = IngestionCoordinator::new(
        args.stream.clone(),
        Arc::new(store),
        transport,
        bus,
        settings.coordinator_config(),
    );
    let (handle, actor) = spawn_coordinator(coordinator);
    let printer = tokio::spawn(print_progress(handle.subscribe()));
    let policy = settings.retry_policy();

    let report = tokio::select! {
        report = sync_with_retry(&handle, &args.scope, args.from, args.to, &policy) => report?,
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    };

    drop(handle);
    let _ = actor.await;
    let _ = printer.await;
    pump.abort();

    info!(
        event = "sync_complete",
        stream = %args.stream,
        attempts = report.attempts,
        status = %report.outcome.status
    );
    println!("{}", serde_json::to_string_pretty(&report.outcome)?);
    if !report.outcome.is_success() {
        let reason = report
            .outcome
            .reason
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown".to_string());
        bail!("sync failed after {} attempt(s): {reason}", report.attempts);
    }
    Ok(())
}

async fn print_progress(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::Started {
                stream,
                correlation_id,
            }) => eprintln!("[{stream}] sync {correlation_id} started"),
            Ok(SyncEvent::Progress {
                stream,
                percent,
                received,
                expected_total,
                ..
            }) => {
                let total = expected_total.map_or_else(|| "?".to_string(), |t| t.to_string());
                eprintln!("[{stream}] {percent:>3}% ({received}/{total})");
            }
            Ok(SyncEvent::Finished { outcome }) => {
                eprintln!(
                    "[{}] {} ({} received, {} skipped)",
                    outcome.stream, outcome.status, outcome.received, outcome.skipped
                );
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

struct SeriesArgs {
    category: CategoryId,
    window: Option<(i64, i64)>,
    granularity: Granularity,
    field: Option<String>,
    range: DateRange,
}

fn run_series(
    settings: &StatlineConfig,
    registry: &StoreRegistry,
    store_name: &str,
    args: SeriesArgs,
) -> Result<()> {
    let store = registry
        .open(store_name)
        .with_context(|| format!("failed to open store '{store_name}'"))?;
    let service = ActivityService::new(store, settings.cache_ttl());
    let selector: Box<dyn Fn(&Record) -> f64 + '_> = match args.field.as_deref() {
        Some(field) => Box::new(selectors::payload_number(field)),
        None => Box::new(selectors::count),
    };
    let series = service
        .series(
            args.category,
            args.window,
            args.granularity,
            selector,
            &args.range,
        )
        .context("failed to build series")?;
    println!("{}", serde_json::to_string_pretty(&series)?);
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreStats {
    store: String,
    records: i64,
    categories: Vec<CategoryStats>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CategoryStats {
    category_id: CategoryId,
    records: i64,
    latest_timestamp: Option<i64>,
}

fn run_stats(registry: &StoreRegistry, store_name: &str) -> Result<()> {
    let store = registry
        .open(store_name)
        .with_context(|| format!("failed to open store '{store_name}'"))?;
    let stats = store.with(|store| {
        let mut categories = Vec::new();
        for (category_id, records) in store.category_counts()? {
            categories.push(CategoryStats {
                category_id,
                records,
                latest_timestamp: store.latest_timestamp(category_id)?,
            });
        }
        Ok(StoreStats {
            store: store_name.to_string(),
            records: store.record_count()?,
            categories,
        })
    })?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
