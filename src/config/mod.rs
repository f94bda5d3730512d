//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::CacheConfig;
use crate::domain::keys::ResourceKind;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "coherence";
const DEFAULT_STORE_URL: &str = "sqlite://coherence.db";
const DEFAULT_STORE_MAX_CONNECTIONS: u32 = 4;

/// Command-line arguments for the coherence operator binary.
#[derive(Debug, Parser)]
#[command(
    name = "coherence",
    version,
    about = "Inspect and maintain the durable cache mirror"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "COHERENCE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Dry-run hydration against the durable store and report what would load.
    Inspect(InspectArgs),
    /// Clear the durable store the way a session end does, keeping drafts.
    Purge(PurgeArgs),
    /// Fetch one query through the engine and persist the result.
    Fetch(FetchArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct CommonOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the durable store URL.
    #[arg(long = "store-url", value_name = "URL")]
    pub store_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct InspectArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct FetchArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,

    /// Override the remote service base URL.
    #[arg(long = "remote-base-url", value_name = "URL")]
    pub remote_base_url: Option<String>,

    /// Resource kind to fetch.
    #[arg(value_name = "KIND")]
    pub kind: String,

    /// Fetch one instance instead of the kind's singleton document.
    #[arg(long, value_name = "ID")]
    pub id: Option<String>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub remote: RemoteSettings,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub url: String,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    /// Unset means no remote is configured; only `fetch` needs one.
    pub base_url: Option<Url>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("COHERENCE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Inspect(args) => raw.apply_common_overrides(&args.overrides),
        Command::Purge(args) => raw.apply_common_overrides(&args.overrides),
        Command::Fetch(args) => {
            raw.apply_common_overrides(&args.overrides);
            if let Some(url) = args.remote_base_url.as_ref() {
                raw.remote.base_url = Some(url.clone());
            }
        }
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    remote: RawRemoteSettings,
    cache: CacheConfig,
}

impl RawSettings {
    fn apply_common_overrides(&mut self, overrides: &CommonOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            store,
            remote,
            mut cache,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let store = build_store_settings(store)?;
        let remote = build_remote_settings(remote, &cache)?;
        // One timeout bounds both the transport and the fetch layer.
        cache.remote_timeout_ms = u64::try_from(remote.timeout.as_millis())
            .map_err(|_| LoadError::invalid("remote.timeout_ms", "value out of range"))?;
        validate_cache(&cache)?;

        Ok(Self {
            logging,
            store,
            remote,
            cache,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let url = store
        .url
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_STORE_URL.to_string());
    if url.is_empty() {
        return Err(LoadError::invalid("store.url", "must not be empty"));
    }
    if !url.starts_with("sqlite:") {
        return Err(LoadError::invalid(
            "store.url",
            format!("`{url}` is not a sqlite URL"),
        ));
    }

    let max_connections = store
        .max_connections
        .unwrap_or(DEFAULT_STORE_MAX_CONNECTIONS);
    let max_connections = NonZeroU32::new(max_connections).ok_or_else(|| {
        LoadError::invalid("store.max_connections", "must be greater than zero")
    })?;

    Ok(StoreSettings {
        url,
        max_connections,
    })
}

fn build_remote_settings(
    remote: RawRemoteSettings,
    cache: &CacheConfig,
) -> Result<RemoteSettings, LoadError> {
    let base_url = match remote.base_url.map(|value| value.trim().to_string()) {
        Some(value) if !value.is_empty() => {
            let url = Url::parse(&value).map_err(|err| {
                LoadError::invalid("remote.base_url", format!("failed to parse: {err}"))
            })?;
            Some(url)
        }
        _ => None,
    };

    let timeout_ms = remote.timeout_ms.unwrap_or(cache.remote_timeout_ms);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "remote.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(RemoteSettings {
        base_url,
        timeout: Duration::from_millis(timeout_ms),
    })
}

fn validate_cache(cache: &CacheConfig) -> Result<(), LoadError> {
    let non_zero = |value: u64, key: &'static str| {
        if value == 0 {
            Err(LoadError::invalid(key, "must be greater than zero"))
        } else {
            Ok(())
        }
    };

    non_zero(cache.default_stale_after_secs, "cache.default_stale_after_secs")?;
    non_zero(cache.default_evict_after_secs, "cache.default_evict_after_secs")?;
    non_zero(cache.max_hydration_age_secs, "cache.max_hydration_age_secs")?;
    non_zero(cache.fetch_retry_attempts.into(), "cache.fetch_retry_attempts")?;
    non_zero(cache.sweep_interval_ms, "cache.sweep_interval_ms")?;
    if cache.notification_queue_capacity == 0 {
        return Err(LoadError::invalid(
            "cache.notification_queue_capacity",
            "must be greater than zero",
        ));
    }
    if cache.consume_batch_limit == 0 {
        return Err(LoadError::invalid(
            "cache.consume_batch_limit",
            "must be greater than zero",
        ));
    }
    if cache.default_evict_after_secs < cache.default_stale_after_secs {
        return Err(LoadError::invalid(
            "cache.default_evict_after_secs",
            "must not be shorter than default_stale_after_secs",
        ));
    }
    ResourceKind::parse(&cache.drafts_kind)
        .map_err(|err| LoadError::invalid("cache.drafts_kind", err.to_string()))?;

    let mut names: Vec<&String> = cache.kinds.keys().collect();
    names.sort();
    for name in names {
        let kind = ResourceKind::parse(name)
            .map_err(|err| LoadError::invalid("cache.kinds", err.to_string()))?;
        let policy = cache.policy(&kind);
        if policy.stale_after.is_zero() || policy.evict_after.is_zero() {
            return Err(LoadError::invalid(
                "cache.kinds",
                format!("`{name}`: durations must be greater than zero"),
            ));
        }
        if policy.evict_after < policy.stale_after {
            return Err(LoadError::invalid(
                "cache.kinds",
                format!("`{name}`: evict_after_secs must not be shorter than stale_after_secs"),
            ));
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRemoteSettings {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
}
