//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "courier";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_PLATFORM_URL: &str = "http://127.0.0.1:8080/api/";
const DEFAULT_PLATFORM_APPLICATION_ID: &str = "courier";
const DEFAULT_PLATFORM_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HARD_DEADLINE_MS: u64 = 3_000;
const DEFAULT_SOFT_DEADLINE_MS: u64 = 15 * 60 * 1_000;
const DEFAULT_ACK_SAFETY_MARGIN_MS: u64 = 500;
const DEFAULT_BUCKET_ROUTE_LIMIT: u64 = 5;
const DEFAULT_BUCKET_ROUTE_WINDOW_MS: u64 = 5_000;
const DEFAULT_BUCKET_GLOBAL_LIMIT: u64 = 50;
const DEFAULT_BUCKET_GLOBAL_WINDOW_MS: u64 = 1_000;
const DEFAULT_BUCKET_IDLE_EVICTION_MS: u64 = 60_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: u64 = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_IDEMPOTENCY_RETENTION_MS: u64 = 15 * 60 * 1_000;
const DEFAULT_IDEMPOTENCY_SWEEP_INTERVAL_MS: u64 = 30_000;
const DEFAULT_CACHE_COMPLETENESS_THRESHOLD: f64 = 0.8;
const DEFAULT_CACHE_RESYNC_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CACHE_VIEW_CAPACITY: u64 = 256;
const DEFAULT_MAINTENANCE_TOKEN_SWEEP_MS: u64 = 1_000;

/// Command-line arguments for the Courier binary.
#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "Courier interaction response server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "COURIER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the Courier HTTP service.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

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

    /// Override the platform API base URL.
    #[arg(long = "platform-url", value_name = "URL")]
    pub platform_url: Option<String>,

    /// Override the hard acknowledgment deadline.
    #[arg(long = "deadline-hard-ms", value_name = "MS")]
    pub deadline_hard_ms: Option<u64>,

    /// Override the soft delivery deadline.
    #[arg(long = "deadline-soft-ms", value_name = "MS")]
    pub deadline_soft_ms: Option<u64>,

    /// Override the maximum delivery attempts.
    #[arg(long = "retry-max-attempts", value_name = "COUNT")]
    pub retry_max_attempts: Option<u64>,

    /// Override the view completeness threshold.
    #[arg(long = "cache-completeness-threshold", value_name = "RATIO")]
    pub cache_completeness_threshold: Option<f64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub platform: PlatformSettings,
    pub deadlines: DeadlineSettings,
    pub buckets: BucketSettings,
    pub retry: RetrySettings,
    pub idempotency: IdempotencySettings,
    pub cache: CacheSettings,
    pub maintenance: MaintenanceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
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
pub struct PlatformSettings {
    pub base_url: Url,
    pub application_id: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct DeadlineSettings {
    pub hard: Duration,
    pub soft: Duration,
    pub ack_safety_margin: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct BucketSettings {
    pub route_limit: NonZeroU32,
    pub route_window: Duration,
    pub global_limit: NonZeroU32,
    pub global_window: Duration,
    pub idle_eviction: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    pub max_attempts: NonZeroU32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct IdempotencySettings {
    pub retention: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub completeness_threshold: f64,
    pub resync_timeout_ms: u64,
    pub view_capacity: NonZeroUsize,
}

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSettings {
    pub token_sweep_interval: Duration,
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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("COURIER").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    platform: RawPlatformSettings,
    deadlines: RawDeadlineSettings,
    buckets: RawBucketSettings,
    retry: RawRetrySettings,
    idempotency: RawIdempotencySettings,
    cache: RawCacheSettings,
    maintenance: RawMaintenanceSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.platform_url.as_ref() {
            self.platform.base_url = Some(url.clone());
        }
        if let Some(ms) = overrides.deadline_hard_ms {
            self.deadlines.hard_ms = Some(ms);
        }
        if let Some(ms) = overrides.deadline_soft_ms {
            self.deadlines.soft_ms = Some(ms);
        }
        if let Some(attempts) = overrides.retry_max_attempts {
            self.retry.max_attempts = Some(attempts);
        }
        if let Some(threshold) = overrides.cache_completeness_threshold {
            self.cache.completeness_threshold = Some(threshold);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            platform,
            deadlines,
            buckets,
            retry,
            idempotency,
            cache,
            maintenance,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let platform = build_platform_settings(platform)?;
        let deadlines = build_deadline_settings(deadlines)?;
        let buckets = build_bucket_settings(buckets)?;
        let retry = build_retry_settings(retry)?;
        let idempotency = build_idempotency_settings(idempotency, &deadlines)?;
        let cache = build_cache_settings(cache)?;
        let maintenance = build_maintenance_settings(maintenance)?;

        Ok(Self {
            server,
            logging,
            platform,
            deadlines,
            buckets,
            retry,
            idempotency,
            cache,
            maintenance,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
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

fn build_platform_settings(platform: RawPlatformSettings) -> Result<PlatformSettings, LoadError> {
    let raw_url = platform
        .base_url
        .unwrap_or_else(|| DEFAULT_PLATFORM_URL.to_string());
    let mut base_url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("platform.base_url", format!("failed to parse: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "platform.base_url",
            "scheme must be http or https",
        ));
    }
    // Relative joins only keep the last segment when the path ends in a slash.
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }

    let application_id = platform
        .application_id
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_PLATFORM_APPLICATION_ID.to_string());
    if application_id.is_empty() {
        return Err(LoadError::invalid(
            "platform.application_id",
            "must not be empty",
        ));
    }

    let request_timeout = positive_millis(
        platform
            .request_timeout_ms
            .unwrap_or(DEFAULT_PLATFORM_REQUEST_TIMEOUT_MS),
        "platform.request_timeout_ms",
    )?;

    Ok(PlatformSettings {
        base_url,
        application_id,
        request_timeout,
    })
}

fn build_deadline_settings(deadlines: RawDeadlineSettings) -> Result<DeadlineSettings, LoadError> {
    let hard = positive_millis(
        deadlines.hard_ms.unwrap_or(DEFAULT_HARD_DEADLINE_MS),
        "deadlines.hard_ms",
    )?;
    let soft = positive_millis(
        deadlines.soft_ms.unwrap_or(DEFAULT_SOFT_DEADLINE_MS),
        "deadlines.soft_ms",
    )?;
    if soft <= hard {
        return Err(LoadError::invalid(
            "deadlines.soft_ms",
            "must be greater than the hard deadline",
        ));
    }

    let ack_safety_margin = Duration::from_millis(
        deadlines
            .ack_safety_margin_ms
            .unwrap_or(DEFAULT_ACK_SAFETY_MARGIN_MS),
    );
    if ack_safety_margin >= hard {
        return Err(LoadError::invalid(
            "deadlines.ack_safety_margin_ms",
            "must be less than the hard deadline",
        ));
    }

    Ok(DeadlineSettings {
        hard,
        soft,
        ack_safety_margin,
    })
}

fn build_bucket_settings(buckets: RawBucketSettings) -> Result<BucketSettings, LoadError> {
    Ok(BucketSettings {
        route_limit: non_zero_u32(
            buckets.route_limit.unwrap_or(DEFAULT_BUCKET_ROUTE_LIMIT),
            "buckets.route_limit",
        )?,
        route_window: positive_millis(
            buckets.route_window_ms.unwrap_or(DEFAULT_BUCKET_ROUTE_WINDOW_MS),
            "buckets.route_window_ms",
        )?,
        global_limit: non_zero_u32(
            buckets.global_limit.unwrap_or(DEFAULT_BUCKET_GLOBAL_LIMIT),
            "buckets.global_limit",
        )?,
        global_window: positive_millis(
            buckets
                .global_window_ms
                .unwrap_or(DEFAULT_BUCKET_GLOBAL_WINDOW_MS),
            "buckets.global_window_ms",
        )?,
        idle_eviction: positive_millis(
            buckets
                .idle_eviction_ms
                .unwrap_or(DEFAULT_BUCKET_IDLE_EVICTION_MS),
            "buckets.idle_eviction_ms",
        )?,
    })
}

fn build_retry_settings(retry: RawRetrySettings) -> Result<RetrySettings, LoadError> {
    let max_attempts = non_zero_u32(
        retry.max_attempts.unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS),
        "retry.max_attempts",
    )?;
    let base_delay = positive_millis(
        retry.base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
        "retry.base_delay_ms",
    )?;
    let max_delay = positive_millis(
        retry.max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS),
        "retry.max_delay_ms",
    )?;
    if max_delay < base_delay {
        return Err(LoadError::invalid(
            "retry.max_delay_ms",
            "must not be less than retry.base_delay_ms",
        ));
    }

    Ok(RetrySettings {
        max_attempts,
        base_delay,
        max_delay,
    })
}

fn build_idempotency_settings(
    idempotency: RawIdempotencySettings,
    deadlines: &DeadlineSettings,
) -> Result<IdempotencySettings, LoadError> {
    let retention = positive_millis(
        idempotency
            .retention_ms
            .unwrap_or(DEFAULT_IDEMPOTENCY_RETENTION_MS),
        "idempotency.retention_ms",
    )?;
    if retention < deadlines.soft {
        return Err(LoadError::invalid(
            "idempotency.retention_ms",
            "must cover at least the soft deadline",
        ));
    }

    let sweep_interval = positive_millis(
        idempotency
            .sweep_interval_ms
            .unwrap_or(DEFAULT_IDEMPOTENCY_SWEEP_INTERVAL_MS),
        "idempotency.sweep_interval_ms",
    )?;

    Ok(IdempotencySettings {
        retention,
        sweep_interval,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let completeness_threshold = cache
        .completeness_threshold
        .unwrap_or(DEFAULT_CACHE_COMPLETENESS_THRESHOLD);
    if !(completeness_threshold > 0.0 && completeness_threshold <= 1.0) {
        return Err(LoadError::invalid(
            "cache.completeness_threshold",
            "must be in (0, 1]",
        ));
    }

    let resync_timeout_ms = cache
        .resync_timeout_ms
        .unwrap_or(DEFAULT_CACHE_RESYNC_TIMEOUT_MS);
    if resync_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.resync_timeout_ms",
            "must be greater than zero",
        ));
    }

    let capacity = cache.view_capacity.unwrap_or(DEFAULT_CACHE_VIEW_CAPACITY);
    let view_capacity = usize::try_from(capacity)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| LoadError::invalid("cache.view_capacity", "must be greater than zero"))?;

    Ok(CacheSettings {
        completeness_threshold,
        resync_timeout_ms,
        view_capacity,
    })
}

fn build_maintenance_settings(
    maintenance: RawMaintenanceSettings,
) -> Result<MaintenanceSettings, LoadError> {
    Ok(MaintenanceSettings {
        token_sweep_interval: positive_millis(
            maintenance
                .token_sweep_interval_ms
                .unwrap_or(DEFAULT_MAINTENANCE_TOKEN_SWEEP_MS),
            "maintenance.token_sweep_interval_ms",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPlatformSettings {
    base_url: Option<String>,
    application_id: Option<String>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDeadlineSettings {
    hard_ms: Option<u64>,
    soft_ms: Option<u64>,
    ack_safety_margin_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBucketSettings {
    route_limit: Option<u64>,
    route_window_ms: Option<u64>,
    global_limit: Option<u64>,
    global_window_ms: Option<u64>,
    idle_eviction_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetrySettings {
    max_attempts: Option<u64>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIdempotencySettings {
    retention_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    completeness_threshold: Option<f64>,
    resync_timeout_ms: Option<u64>,
    view_capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMaintenanceSettings {
    token_sweep_interval_ms: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
