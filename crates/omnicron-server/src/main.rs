//! Omnicron server entry point.

use std::error::Error;
use std::sync::Arc;

use omnicron_core::aggregate::Aggregate;
use omnicron_core::command::Command;
use omnicron_core::error::DomainError;
use omnicron_core::event::Event;
use omnicron_core::journal::Journal;
use omnicron_core::mem_journal::MemJournal;
use omnicron_event_store::pg_journal::{PgJournal, PgJournalConfig};
use omnicron_server::auth::SharedToken;
use omnicron_server::bus::EventBus;
use omnicron_server::config::{Config, JournalKind};
use omnicron_server::error::AppError;
use omnicron_server::router::CommandRouter;
use omnicron_server::state::AppState;
use serde::Serialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default, Serialize)]
struct Counter {
    value: i64,
}

/// The `counter` stream type: `Increment`/`Decrement` by `payload.by`
/// (default 1).
fn counter(journal: Arc<dyn Journal>) -> Result<Aggregate<Counter>, DomainError> {
    let step = |command: &Command| command.payload["by"].as_i64().unwrap_or(1);
    let changed = |state: &Counter, event: &Event| Counter {
        value: state.value + event.payload["by"].as_i64().unwrap_or(0),
    };

    Aggregate::builder(Counter::default())
        .command("Increment", move |_: &Counter, command: &Command| {
            Ok::<_, DomainError>(Event::new("Changed", json!({ "by": step(command) })))
        })
        .command("Decrement", move |_: &Counter, command: &Command| {
            Ok::<_, DomainError>(Event::new("Changed", json!({ "by": -step(command) })))
        })
        .event("Changed", changed)
        .journal(journal)
        .build()
}

async fn open_journal(config: &Config) -> Result<Arc<dyn Journal>, AppError> {
    match config.journal {
        JournalKind::Memory if config.production => Ok(Arc::new(MemJournal::production())),
        JournalKind::Memory => Ok(Arc::new(MemJournal::new())),
        JournalKind::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                AppError::Config("DATABASE_URL environment variable must be set".into())
            })?;
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let journal = PgJournal::new(
                pool,
                PgJournalConfig {
                    table: config.journal_table.clone(),
                    allow_reset: !config.production,
                },
            )?;
            journal.init().await?;
            Ok(Arc::new(journal))
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting Omnicron server");

    let config = Config::from_env()?;
    let journal = open_journal(&config).await?;

    let mut router = CommandRouter::new();
    router.register("counter", Arc::new(counter(journal)?));

    let mut state = AppState::new(router, EventBus::new(config.bus_capacity));
    if let Some(token) = &config.auth_token {
        state = state.with_authorizer(Arc::new(SharedToken::new(token.clone())));
    }

    let addr = config.addr()?;
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, omnicron_server::app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
