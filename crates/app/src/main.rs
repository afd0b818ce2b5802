mod guard;
mod idempotency;
mod problem;
mod router;
mod secret;
mod sweeper;
mod telemetry;

use std::net::SocketAddr;

use tracing::{info, warn};
use webhook_gate_storage::Database;
use webhook_gate_util::{load_env_file, AppConfig, ConfigError};

use crate::guard::{GuardConfig, WebhookGuard};
use crate::idempotency::IdempotencyBackend;
use crate::secret::SecretResolver;
use crate::sweeper::IdempotencySweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;
    let settings = &config.webhook;

    let database = match settings.database_url.as_deref() {
        Some(url) => {
            let database = Database::connect(url).await?;
            database.run_migrations().await?;
            info!(stage = "app", "sqlite storage ready");
            Some(database)
        }
        None => {
            warn!(
                stage = "app",
                "DATABASE_URL not set; idempotency records are kept in memory and reset on restart"
            );
            None
        }
    };

    let resolver = match (&database, settings.tenant_header.clone(), settings.secret.clone()) {
        (Some(database), Some(header), _) => {
            info!(stage = "app", %header, "resolving webhook secrets per tenant");
            SecretResolver::tenant(database.tenant_secrets(), header)
        }
        (_, _, Some(secret)) => SecretResolver::fixed(secret),
        _ => return Err(ConfigError::MissingSecret.into()),
    };

    let backend = match &database {
        Some(database) => IdempotencyBackend::Sqlite(database.idempotency()),
        None => IdempotencyBackend::memory(),
    };

    let sweeper = IdempotencySweeper::new(backend.clone(), settings.sweep_interval).start();
    let guard = WebhookGuard::new(GuardConfig::from_settings(settings), resolver, backend);
    let state = router::AppState::new(metrics, guard);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.stop().await;
    if let Some(database) = database {
        database.close().await;
    }
    info!(stage = "app", "server stopped");
    served.map_err(|err| err.into())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(stage = "app", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(stage = "app", "shutdown signal received");
}
