use std::{process, sync::Arc};

use courier::{
    application::{
        buckets::{BucketConfig, BucketTracker},
        builtin,
        coordinator::{CoordinatorConfig, CoordinatorParts, InteractionCoordinator},
        error::AppError,
        failures::TracingFailureSink,
        idempotency::IdempotencyGuard,
        maintenance::{self, MaintenanceConfig},
        retry::{RetryPolicy, RetryScheduler},
    },
    cache::{CacheConfig, MaterializedViewCache, RequestCache},
    config,
    domain::tokens::Deadlines,
    infra::{
        documents::MemoryDocumentStore,
        error::InfraError,
        http::{self, HttpState},
        telemetry,
        transport::HttpTransport,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let coordinator = build_coordinator(&settings)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let maintenance_handle = maintenance::spawn(
        coordinator.clone(),
        MaintenanceConfig {
            expiry_interval: settings.maintenance.token_sweep_interval,
            sweep_interval: settings.idempotency.sweep_interval,
        },
        shutdown_rx,
    );

    let result = serve_http(&settings, HttpState::new(coordinator)).await;

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(settings.server.graceful_shutdown, maintenance_handle)
        .await
        .is_err()
    {
        warn!(
            target = "courier::serve",
            "Maintenance loop did not stop within the graceful shutdown window"
        );
    }

    result
}

fn build_coordinator(settings: &config::Settings) -> Result<InteractionCoordinator, AppError> {
    let transport = Arc::new(HttpTransport::new(&settings.platform)?);
    let documents = Arc::new(MemoryDocumentStore::new());

    let tracker = Arc::new(BucketTracker::new(BucketConfig {
        route_limit: settings.buckets.route_limit,
        route_window: settings.buckets.route_window,
        global_limit: settings.buckets.global_limit,
        global_window: settings.buckets.global_window,
        idle_eviction: settings.buckets.idle_eviction,
    }));
    let retry = RetryScheduler::new(RetryPolicy {
        max_attempts: settings.retry.max_attempts,
        base_delay: settings.retry.base_delay,
        max_delay: settings.retry.max_delay,
    });

    Ok(InteractionCoordinator::new(CoordinatorParts {
        config: CoordinatorConfig {
            deadlines: Deadlines {
                hard: settings.deadlines.hard,
                soft: settings.deadlines.soft,
            },
            ack_safety_margin: settings.deadlines.ack_safety_margin,
        },
        handlers: builtin::registry(),
        transport,
        tracker,
        retry,
        idempotency: Arc::new(IdempotencyGuard::new(settings.idempotency.retention)),
        requests: Arc::new(RequestCache::new(documents.clone())),
        views: Arc::new(MaterializedViewCache::new(CacheConfig::from(&settings.cache))),
        view_source: documents,
        sink: Arc::new(TracingFailureSink),
    }))
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "courier::serve",
        addr = %settings.server.addr,
        platform = %settings.platform.base_url,
        "Listening for interactions"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    info!(target = "courier::serve", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(
            target = "courier::serve",
            error = %err,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
