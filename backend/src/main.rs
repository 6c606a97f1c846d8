use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod sequences;
mod services;
mod validation;


use jobs::{ExecutionLogs, JobScheduler, SequencePollerJob};
use sequences::{
    EnrollmentService, EnrollmentStore, ExecutorSettings, HttpWebhookCaller, PgSequenceStore,
    PlaceholderRenderer, SequenceAdmin, StepExecutor,
};

pub struct AppState {
    pub enrollments: EnrollmentService,
    pub admin: SequenceAdmin,
    pub poller: Arc<SequencePollerJob>,
    pub job_logs: ExecutionLogs,
}

pub fn build_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/sequences", handlers::sequence_routes())
        .nest("/api/v1/enrollments", handlers::enrollment_routes())
        .nest("/api/v1/jobs", handlers::job_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(app_state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("crm_backend=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database).await?;

    database::migrate(&db_pool).await?;

    if !config.smtp.is_configured() {
        tracing::warn!("SMTP credentials are not configured; sequence emails will fail to send");
    }

    let store: Arc<dyn EnrollmentStore> = Arc::new(PgSequenceStore::new(db_pool));
    let email_service = services::EmailService::new(&config.smtp)?;
    let webhooks = HttpWebhookCaller::new(config.sequences.webhook_timeout())?;

    let executor = StepExecutor::new(
        store.clone(),
        Arc::new(PlaceholderRenderer::new()),
        Arc::new(email_service),
        Arc::new(webhooks),
        ExecutorSettings::from(&config.sequences),
    );
    let poller = Arc::new(SequencePollerJob::new(store.clone(), executor, &config.sequences));
    let job_logs: ExecutionLogs = Arc::new(RwLock::new(Vec::new()));

    let mut scheduler = JobScheduler::new(poller.clone(), config.sequences.clone(), job_logs.clone()).await?;
    scheduler.start().await?;

    let app_state = Arc::new(AppState {
        enrollments: EnrollmentService::new(store.clone()),
        admin: SequenceAdmin::new(store),
        poller,
        job_logs,
    });

    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await?;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
