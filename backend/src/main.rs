use axum::{http::Method, routing::get, Router};
use std::sync::Arc;
use tokio::sync::Notify;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod approvals;
mod auth;
mod automation;
mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod pagination;
mod services;
mod store;
mod validation;


use approvals::ApprovalEngine;
use automation::{ActionExecutor, AutomationEngine, RepositoryHost, ScriptSandbox};
use config::{AutomationConfig, OutboxConfig};
use jobs::{ExecutionLogs, JobConfig, JobScheduler, OutboxDispatcher};
use services::{
    AuditService, HttpSyncService, LogMailer, Mailer, ModuleService, RecordOrchestrator, SmtpMailer,
    SyncService, WebhookService,
};
use store::{PgStore, Repositories};
use validation::RecordValidator;

pub struct AppState {
    pub repos: Repositories,
    pub modules: ModuleService,
    pub records: RecordOrchestrator,
    pub approvals: Arc<ApprovalEngine>,
    pub automation: Arc<AutomationEngine>,
    pub audit: AuditService,
    pub dispatcher: Arc<OutboxDispatcher>,
    pub job_logs: ExecutionLogs,
}

impl AppState {
    /// Wires every service over one set of repositories.
    pub fn new(
        repos: Repositories,
        automation_config: &AutomationConfig,
        outbox_config: OutboxConfig,
        mailer: Arc<dyn Mailer>,
        sync: Arc<dyn SyncService>,
    ) -> Self {
        let outbox_signal = Arc::new(Notify::new());
        let audit = AuditService::new(repos.audit.clone());
        let validator = RecordValidator::new(repos.records.clone(), repos.files.clone());

        let approvals = Arc::new(ApprovalEngine::new(
            repos.workflows.clone(),
            repos.records.clone(),
            repos.modules.clone(),
            audit.clone(),
            outbox_signal.clone(),
        ));

        let script_host = Arc::new(RepositoryHost::new(
            repos.modules.clone(),
            repos.records.clone(),
            validator.clone(),
        ));
        let executor = Arc::new(ActionExecutor::new(
            &repos,
            mailer,
            sync,
            ScriptSandbox::new(script_host, automation_config.script.clone()),
            automation_config.http_timeout,
        ));
        let automation = Arc::new(AutomationEngine::new(
            repos.rules.clone(),
            repos.modules.clone(),
            executor,
            audit.clone(),
        ));

        let dispatcher = Arc::new(OutboxDispatcher::new(
            repos.outbox.clone(),
            automation.clone(),
            WebhookService::new(repos.records.clone(), automation_config.http_timeout),
            outbox_signal.clone(),
            outbox_config,
        ));

        let records = RecordOrchestrator::new(
            repos.clone(),
            validator,
            approvals.clone(),
            audit.clone(),
            outbox_signal,
        );

        Self {
            modules: ModuleService::new(repos.modules.clone(), audit.clone()),
            records,
            approvals,
            automation,
            audit,
            dispatcher,
            job_logs: ExecutionLogs::default(),
            repos,
        }
    }
}

pub fn app_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "CRM API v1" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1", handlers::api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let repos = Repositories::from_store(Arc::new(PgStore::new(db_pool)));
    let seeded = services::system_modules::seed(repos.modules.as_ref()).await?;
    if seeded > 0 {
        tracing::info!("Seeded {} system modules", seeded);
    }

    let mailer: Arc<dyn Mailer> = if config.smtp.is_configured() {
        Arc::new(SmtpMailer::new(&config.smtp))
    } else {
        tracing::warn!("SMTP not configured, outgoing email will only be logged");
        Arc::new(LogMailer)
    };
    let sync: Arc<dyn SyncService> = Arc::new(HttpSyncService::new(
        repos.modules.clone(),
        repos.records.clone(),
        RecordValidator::new(repos.records.clone(), repos.files.clone()),
        config.automation.http_timeout,
    ));

    let mut app_state = AppState::new(repos, &config.automation, config.outbox.clone(), mailer, sync);

    let mut scheduler = JobScheduler::new(app_state.repos.outbox.clone(), JobConfig::from_outbox(&config.outbox)).await?;
    scheduler.start().await?;
    app_state.job_logs = scheduler.execution_logs();

    let app_state = Arc::new(app_state);
    let dispatcher = app_state.dispatcher.clone().spawn();

    let app = app_router(app_state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.abort();
    scheduler.shutdown().await?;
    match app_state.dispatcher.drain().await {
        Ok(n) if n > 0 => tracing::info!("Dispatched {} outbox events before exit", n),
        Ok(_) => {}
        Err(e) => tracing::error!("Final outbox drain failed: {}", e),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
