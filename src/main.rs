use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use swipepay_backend::api::payments::{self, PaymentsState};
use swipepay_backend::api::webhooks::{self, WebhookState};
use swipepay_backend::config::AppConfig;
use swipepay_backend::database::memory_store::MemoryPaymentStore;
use swipepay_backend::database::repository::PaymentStore;
use swipepay_backend::health::{HealthChecker, HealthState, HealthStatus};
use swipepay_backend::logging::init_tracing;
use swipepay_backend::middleware::logging::{request_logging_middleware, UuidRequestId};
use swipepay_backend::payments::provider::PaymentProvider;
use swipepay_backend::payments::providers::mpesa::{MpesaConfig, MpesaProvider};
use swipepay_backend::services::{FinalizationEngine, StatusRefreshService, WebhookProcessor};
use swipepay_backend::workers::payment_sweeper::{PaymentSweeperConfig, PaymentSweeperWorker};
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[derive(Clone)]
struct AppState {
    health_checker: HealthChecker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    config.validate()?;
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        skip_externals = config.skip_externals,
        verification_window_secs = config.payments.verification_window.as_secs(),
        "🚀 Starting payment reconciliation service"
    );

    let store = build_store(&config).await?;
    let provider = build_provider(config.skip_externals)?;
    info!(provider = provider.name(), "💳 Payment provider ready");

    let engine = Arc::new(FinalizationEngine::new(
        store.clone(),
        config.payments.clone(),
    ));
    let refresh = Arc::new(StatusRefreshService::new(
        store.clone(),
        provider.clone(),
        engine.clone(),
        config.payments.clone(),
    ));
    let webhook_processor = Arc::new(WebhookProcessor::new(
        store.clone(),
        provider.clone(),
        engine.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper_config = PaymentSweeperConfig::from_env(config.payments.verification_window);
    let sweeper_handle = if sweeper_config.enabled {
        let worker = PaymentSweeperWorker::new(
            store.clone(),
            provider.clone(),
            engine.clone(),
            sweeper_config,
        );
        info!("🧹 Payment sweeper enabled");
        Some(tokio::spawn(worker.run(shutdown_rx.clone())))
    } else {
        warn!("⚠️  Payment sweeper disabled (PAYMENT_SWEEPER_ENABLED=false)");
        None
    };

    let app_state = AppState {
        health_checker: HealthChecker::new(store.clone()),
    };

    let app = Router::new()
        .route("/health", get(health))
        .with_state(app_state)
        .merge(payments::routes(PaymentsState {
            refresh,
            verification_window: config.payments.verification_window,
        }))
        .merge(webhooks::routes(Arc::new(WebhookState {
            processor: webhook_processor,
        })))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "🌐 Server listening");
    info!("📋 Routes: GET /health, GET /api/payments/{{payment_id}}, POST /api/payments/{{payment_id}}/refresh, POST /webhooks/mpesa");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(shutdown_tx))
        .await?;

    if let Some(handle) = sweeper_handle {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(())) => info!("Payment sweeper shut down cleanly"),
            Ok(Err(e)) => error!(error = %e, "Payment sweeper task panicked"),
            Err(_) => warn!("Payment sweeper did not stop within 5s"),
        }
    }

    info!("👋 Server shut down");
    Ok(())
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn PaymentStore>> {
    #[cfg(feature = "database")]
    if let Some(db) = &config.database {
        info!("🗄️  Connecting to Postgres");
        let pool = swipepay_backend::database::init_pool_from_config(db).await?;
        swipepay_backend::database::health_check(&pool).await?;
        info!("✅ Database connection established");
        return Ok(Arc::new(
            swipepay_backend::database::payment_repository::PgPaymentRepository::new(pool),
        ));
    }

    if !config.skip_externals {
        anyhow::bail!("DATABASE_URL is configured but the binary was built without the database feature");
    }
    warn!("⚠️  SKIP_EXTERNALS=true, payments are kept in memory and lost on restart");
    Ok(Arc::new(MemoryPaymentStore::new()))
}

fn build_provider(skip_externals: bool) -> anyhow::Result<Arc<dyn PaymentProvider>> {
    match MpesaProvider::from_env() {
        Ok(provider) => Ok(Arc::new(provider)),
        Err(e) if skip_externals => {
            // Lookups fail and surface as provider_error until configured.
            warn!(error = %e, "⚠️  M-Pesa aggregator not configured, using loopback placeholder");
            let provider = MpesaProvider::new(MpesaConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                api_key: "unconfigured".to_string(),
                ..MpesaConfig::default()
            })?;
            Ok(Arc::new(provider))
        }
        Err(e) => Err(e.into()),
    }
}

async fn health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, String)> {
    let health_status = state.health_checker.check_health().await;

    if health_status.status == HealthState::Unhealthy {
        error!("❌ Health check failed - service unhealthy");
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable".to_string(),
        ))
    } else {
        Ok(Json(health_status))
    }
}
