use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::{
    adapters::{Collaborators, PlatformApiClient, SandboxLedger, SandboxPayoutGateway, SandboxProfiles},
    api::handler::AppState,
    config::Config,
    error::AppResult,
    settlement::{
        events::{BroadcastEventPublisher, EventPublisher, FanoutEventPublisher, WebhookEventPublisher},
        DisputeHandler, QueryService, RetryPolicy, RetryWorker, SettlementOrchestrator, SettlementScheduler,
    },
    storage::Stores,
};

/// Every long-lived service, wired but not yet started
pub struct Engine {
    pub state: AppState,
    pub retry_worker: Arc<RetryWorker>,
}

/// Wire the engine over the given stores and collaborators
pub fn assemble(config: &Config, stores: &Stores, collaborators: &Collaborators) -> AppResult<Engine> {
    let policy = RetryPolicy::from_config(&config.retry);

    let orchestrator = Arc::new(SettlementOrchestrator::new(
        stores,
        collaborators,
        config.fees.clone(),
        policy,
        config.external_call_timeout(),
    ));

    let disputes = Arc::new(DisputeHandler::new(
        orchestrator.clone(),
        stores.disputes.clone(),
        collaborators.events.clone(),
    ));

    let queries = Arc::new(QueryService::new(stores));

    let scheduler = Arc::new(SettlementScheduler::new(
        orchestrator.clone(),
        stores,
        collaborators,
        config.scheduler.clone(),
    )?);

    let retry_worker = Arc::new(RetryWorker::new(
        orchestrator.clone(),
        stores.retry_queue.clone(),
        stores.settlements.clone(),
        policy,
        Duration::from_secs(config.retry.poll_interval_secs),
    ));

    Ok(Engine {
        state: AppState {
            orchestrator,
            disputes,
            queries,
            scheduler,
        },
        retry_worker,
    })
}

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let stores = match &config.database_url {
        Some(database_url) => Stores::postgres(initialize_database(database_url).await?),
        None => {
            warn!("⚠️ No database_url configured - using in-memory stores, state is lost on restart");
            Stores::in_memory()
        }
    };

    let collaborators = initialize_collaborators(config)?;
    let engine = assemble(config, &stores, &collaborators)?;

    engine.state.scheduler.clone().start();
    info!(
        "✅ Settlement scheduler started (every {}s, {} users in parallel)",
        config.scheduler.tick_interval_secs, config.scheduler.max_concurrency
    );

    engine.retry_worker.clone().start();
    info!(
        "✅ Retry worker started (max {} attempts, {}s linear backoff)",
        config.retry.max_attempts, config.retry.base_delay_secs
    );

    Ok(engine.state)
}

fn initialize_collaborators(config: &Config) -> AppResult<Collaborators> {
    let timeout = config.external_call_timeout();

    let broadcast = BroadcastEventPublisher::default();
    spawn_event_log(&broadcast);
    let broadcast: Arc<dyn EventPublisher> = Arc::new(broadcast);

    let events: Arc<dyn EventPublisher> = match &config.event_webhook_url {
        Some(url) => {
            info!("✅ Event webhook configured: {}", url);
            let webhook: Arc<dyn EventPublisher> = Arc::new(WebhookEventPublisher::new(url, timeout)?);
            Arc::new(FanoutEventPublisher::new(vec![broadcast, webhook]))
        }
        None => broadcast,
    };

    match &config.platform_api_url {
        Some(url) => {
            let client = Arc::new(PlatformApiClient::new(url, timeout)?);
            info!("✅ Platform API client initialized: {}", url);
            Ok(Collaborators {
                ledger: client.clone(),
                profiles: client.clone(),
                gateway: client,
                events,
            })
        }
        None => {
            warn!("⚠️ No platform_api_url configured - using sandbox ledger, profiles and payouts");
            Ok(Collaborators {
                ledger: Arc::new(SandboxLedger::new()),
                profiles: Arc::new(SandboxProfiles::permissive()),
                gateway: Arc::new(SandboxPayoutGateway::new()),
                events,
            })
        }
    }
}

/// Mirror every lifecycle event into the log
fn spawn_event_log(broadcast: &BroadcastEventPublisher) {
    let mut receiver = broadcast.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => info!("📣 {} {}", envelope.event, envelope.payload),
                Err(RecvError::Lagged(skipped)) => warn!("⚠️ Event log lagged, skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 50 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
