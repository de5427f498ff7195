use mfa_service::{
    build_router,
    config::MfaConfig,
    models::ProviderCode,
    services::{
        HttpVerificationEngine, ProviderRegistry, RedisService, SecondFactorSession,
        SecurityAlertSink, SessionPrincipalResolver, SystemClock, TrustedDeviceManager,
        VerificationOrchestrator,
    },
    AppState,
};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = MfaConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    mfa_service::services::metrics::init_metrics()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to init metrics: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting MFA service"
    );

    let redis = Arc::new(RedisService::new(&config.redis).await?);
    tracing::info!("Redis service initialized");

    let clock = Arc::new(SystemClock);

    let mut registry = ProviderRegistry::new(redis.clone()).with_allowed(
        config
            .mfa
            .allowed_providers
            .iter()
            .map(|code| ProviderCode::new(code.as_str())),
    );
    for code in &config.mfa.allowed_providers {
        let provider = ProviderCode::new(code.as_str());
        let engine = HttpVerificationEngine::new(
            &config.mfa.verifier_url,
            provider.clone(),
            config.mfa.verifier_timeout(),
        )?;
        registry.register(provider, Arc::new(engine));
    }
    tracing::info!(
        providers = ?config.mfa.allowed_providers,
        "Verification engines registered"
    );

    let trusted_devices = TrustedDeviceManager::new(
        redis.clone(),
        clock.clone(),
        config.mfa.trust_devices_enabled,
        config.mfa.trust_lifetime(),
    );
    let session = SecondFactorSession::new(redis.clone(), clock);
    let alerts = SecurityAlertSink::spawn(
        redis.clone(),
        config.mfa.alert_queue_capacity,
        config.mfa.side_effect_timeout(),
    );

    let orchestrator = VerificationOrchestrator::new(
        Arc::new(SessionPrincipalResolver::new(redis.clone())),
        registry,
        trusted_devices,
        session,
        alerts,
        config.mfa.side_effect_timeout(),
    );

    let state = AppState {
        config: config.clone(),
        orchestrator: Arc::new(orchestrator),
        health: redis,
    };

    let app = build_router(state).await?;

    let addr = config.common.bind_addr()?;

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
