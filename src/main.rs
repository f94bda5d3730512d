use std::{process::ExitCode, sync::Arc};

use coherence::{
    application::{
        clock::{Clock, SystemClock},
        engine::CoherenceEngine,
        error::AppError,
        repos::DurableStore,
    },
    cache::{HydrationCoordinator, HydrationReport, QueryCache, SyncedCache},
    config::{self, Command, FetchArgs, Settings},
    domain::keys::{CacheKey, ResourceKind},
    infra::{db::SqliteStore, error::InfraError, http::HttpRemoteSource, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_application_error(&error);
            ExitCode::from(error.exit_code())
        }
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(source = report.source, causes = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(source = report.source, causes = ?report.messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Inspect(_) => run_inspect(settings).await,
        Command::Purge(_) => run_purge(settings).await,
        Command::Fetch(args) => run_fetch(settings, args).await,
    }
}

async fn open_store(settings: &Settings) -> Result<Arc<SqliteStore>, AppError> {
    let store = SqliteStore::open(&settings.store.url, settings.store.max_connections.get())
        .await
        .map_err(InfraError::from)?;
    Ok(Arc::new(store))
}

fn synced_cache(settings: &Settings, store: Arc<SqliteStore>) -> Arc<SyncedCache> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Arc::new(SyncedCache::new(
        QueryCache::new(clock),
        store,
        Arc::new(settings.cache.clone()),
    ))
}

async fn run_inspect(settings: Settings) -> Result<(), AppError> {
    let store = open_store(&settings).await?;
    let report = HydrationCoordinator::new(synced_cache(&settings, store))
        .inspect()
        .await;
    print_report(&report);

    if !report.failed.is_empty() {
        return Err(AppError::unexpected(format!(
            "unreadable tables: {}",
            report.failed.join(", ")
        )));
    }
    Ok(())
}

fn print_report(report: &HydrationReport) {
    let mut kinds: Vec<&String> = report.loaded.keys().chain(report.expired.keys()).collect();
    kinds.sort();
    kinds.dedup();

    println!("{:<32} {:>8} {:>8}", "kind", "loaded", "expired");
    for kind in kinds {
        println!(
            "{:<32} {:>8} {:>8}",
            kind,
            report.loaded.get(kind).copied().unwrap_or(0),
            report.expired.get(kind).copied().unwrap_or(0),
        );
    }
    println!(
        "{:<32} {:>8} {:>8}",
        "total",
        report.total_loaded(),
        report.total_expired()
    );
    for table in &report.skipped {
        println!("skipped (not persisted): {table}");
    }
    for table in &report.failed {
        println!("failed: {table}");
    }
}

async fn run_purge(settings: Settings) -> Result<(), AppError> {
    let store = open_store(&settings).await?;
    let cache = synced_cache(&settings, store);
    cache.clear_session().await;

    let remaining = cache.store().tables().await?;
    info!(
        target = "coherence::purge",
        drafts_kind = %settings.cache.drafts_kind,
        remaining = ?remaining,
        "Durable store purged"
    );
    println!("purged; remaining tables: {}", remaining.join(", "));
    Ok(())
}

async fn run_fetch(settings: Settings, args: FetchArgs) -> Result<(), AppError> {
    let kind = ResourceKind::parse(&args.kind)?;
    let key = match args.id {
        Some(id) => CacheKey::detail(kind, id),
        None => CacheKey::singleton(kind),
    };

    let base_url = settings.remote.base_url.clone().ok_or_else(|| {
        AppError::validation("fetch requires remote.base_url or --remote-base-url")
    })?;
    let remote = HttpRemoteSource::new(base_url, settings.remote.timeout)
        .map_err(InfraError::from)?;
    let store = open_store(&settings).await?;

    let engine = CoherenceEngine::new(
        settings.cache.clone(),
        store,
        Arc::new(remote),
        Arc::new(SystemClock),
    );
    let report = engine.start().await;
    info!(
        target = "coherence::fetch",
        hydrated = report.total_loaded(),
        key = %key,
        "Fetching"
    );

    let entry = engine.fetch(&key).await?;
    let rendered = serde_json::to_string_pretty(&entry.value)
        .map_err(|err| AppError::unexpected(err.to_string()))?;
    println!("{rendered}");

    if engine.is_degraded() {
        return Err(AppError::unexpected(
            "fetched value could not be persisted to the durable store",
        ));
    }
    Ok(())
}
