use std::sync::Arc;

use mentor_api::http;
use shared::config::{ApiConfig, LogFormat};
use shared::llm::{CircuitBreakerConfig, CircuitBreakerGateway, ProviderConfig, ProviderGateway};
use shared::personas::PersonalityRegistry;
use shared::relay::{MentorRelay, SessionTurnLocks, TurnThrottle, TurnThrottleConfig};
use shared::repos::Store;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "mentor_api=debug,shared=info,tower_http=info";

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = match ApiConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            init_tracing(LogFormat::Text);
            error!("failed to read config: {err}");
            std::process::exit(1);
        }
    };
    init_tracing(config.log_format);

    let registry = match &config.personalities_path {
        Some(path) => match PersonalityRegistry::from_json_file(path) {
            Ok(registry) => registry,
            Err(err) => {
                error!("failed to load personalities from {}: {err}", path.display());
                std::process::exit(1);
            }
        },
        None => PersonalityRegistry::builtin(),
    };
    info!(personalities = registry.len(), "personality registry loaded");

    let store = match Store::connect(&config.database_url, config.database_max_connections).await
    {
        Ok(store) => store,
        Err(err) => {
            error!("failed to connect to postgres: {err}");
            std::process::exit(1);
        }
    };

    let migrator = match sqlx::migrate::Migrator::new(config.migrations_dir.clone()).await {
        Ok(migrator) => migrator,
        Err(err) => {
            error!("failed to load migrations: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = migrator.run(store.pool()).await {
        error!("failed to run migrations: {err}");
        std::process::exit(1);
    }

    let provider_config = match ProviderConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to read llm provider config: {err}");
            std::process::exit(1);
        }
    };
    let breaker_config = match CircuitBreakerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to read llm circuit breaker config: {err}");
            std::process::exit(1);
        }
    };
    let throttle = match TurnThrottleConfig::from_env().and_then(TurnThrottle::new) {
        Ok(throttle) => throttle,
        Err(err) => {
            error!("failed to read turn rate limit config: {err}");
            std::process::exit(1);
        }
    };
    info!(
        provider = provider_config.kind.as_str(),
        model = provider_config.model_route.primary_model.as_str(),
        "llm provider configured"
    );
    let provider = match ProviderGateway::new(provider_config) {
        Ok(provider) => provider,
        Err(err) => {
            error!("failed to build llm gateway: {err}");
            std::process::exit(1);
        }
    };
    let gateway = match CircuitBreakerGateway::new(provider, breaker_config) {
        Ok(gateway) => gateway,
        Err(err) => {
            error!("failed to build llm circuit breaker: {err}");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(registry);
    let store = Arc::new(store);
    let mut relay = MentorRelay::new(
        registry.clone(),
        store.clone(),
        Arc::new(gateway),
        config.history_window,
    )
    .with_throttle(throttle);
    if config.serialize_session_turns {
        relay = relay.with_session_locks(SessionTurnLocks::new());
    }

    let app = http::build_router(http::AppState {
        registry,
        relay,
        conversations: store.clone(),
        sessions: store.clone(),
        profiles: store,
    });

    let addr = config.bind_addr;

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };

    info!(
        "mentor api listening on {}",
        listener.local_addr().unwrap_or(addr)
    );
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing(log_format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
