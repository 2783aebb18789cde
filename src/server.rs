use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handler::{
    cancel_settlement, create_settlement, get_dispute, get_schedule, get_settlement, get_settlement_report,
    get_user_settlements, get_user_stats, health_check, open_dispute, process_settlement, retry_settlement,
    set_schedule_enabled, upsert_schedule, AppState,
};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Settlement endpoints
                .route("/settlements", post(create_settlement))
                .route("/settlements/:id", get(get_settlement))
                .route("/settlements/:id/process", post(process_settlement))
                .route("/settlements/:id/retry", post(retry_settlement))
                .route("/settlements/:id/cancel", post(cancel_settlement))
                .route("/settlements/:id/disputes", post(open_dispute))
                .route("/settlements/:id/report", get(get_settlement_report))
                // Per-user views and schedules
                .route("/users/:user_id/settlements", get(get_user_settlements))
                .route("/users/:user_id/settlements/stats", get(get_user_stats))
                .route("/users/:user_id/schedule", put(upsert_schedule).get(get_schedule))
                .route("/users/:user_id/schedule/enabled", post(set_schedule_enabled))
                // Disputes
                .route("/disputes/:id", get(get_dispute)),
        )
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
