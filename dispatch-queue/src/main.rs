//! The queue daemon: owns all mutable dispatch state and exposes the
//! HTTP surface described in the external interface. Structurally this
//! mirrors `hook-janitor::main` (a `clap`-configured binary, a
//! Prometheus metrics router, one or more background loops raced against
//! the HTTP server) generalized from one cleanup loop to three: the
//! expiry sweeper, the registry rescanner, and the email dispatcher.

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use time::Duration;
use tower_http::limit::RequestBodyLimitLayer;

use dispatch_common::config::{load_settings, CommonArgs};
use dispatch_common::email::{EmailDispatcher, SmtpConfig};
use dispatch_common::health::HealthRegistry;
use dispatch_common::metrics::setup_metrics_router;
use dispatch_common::registry::ModelRegistry;

mod error;
mod handlers;
mod state;
mod sweeper;

pub struct AppState {
    pub state: state::QueueState,
    pub registry: ModelRegistry,
    pub email: EmailDispatcher,
    pub request_secret: String,
    pub public_base_url: String,
}

const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn build_router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/client_model_create", post(handlers::client_model_create))
        .route("/client_confirm/:code", get(handlers::client_confirm))
        .route(
            "/client_queue_has_workers",
            get(handlers::client_queue_has_workers),
        )
        .route("/worker_info", get(handlers::worker_info))
        .route("/worker_work_task", post(handlers::worker_work_task))
        .route(
            "/worker_keep_alive_task/:id",
            get(handlers::worker_keep_alive_task),
        )
        .route("/worker_succeed_task/:id", get(handlers::worker_succeed_task))
        .route("/worker_failed_task/:id", get(handlers::worker_failed_task))
        .route("/worker_has_task/:id", get(handlers::worker_has_task))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(app)
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = CommonArgs::parse();
    args.init_logging()?;

    let settings = load_settings(&args.config, args.port)?;

    let registry = ModelRegistry::new();
    let model_dir = PathBuf::from(&settings.rendering.model_directory);
    registry.scan_directory(&model_dir)?;

    let email = EmailDispatcher::spawn(SmtpConfig {
        server: settings.email.smtp_server.clone(),
        port: settings.email.smtp_port,
        username: settings.email.smtp_username.clone(),
        password: settings.email.smtp_password.clone(),
        use_tls: settings.email.use_tls,
        from_address: settings.email.from_address.clone(),
        cc: settings.email.cc.clone(),
        bcc: settings.email.bcc.clone(),
    });

    let queue_state = state::QueueState::new(
        PathBuf::from(&settings.queue.state_file),
        Duration::minutes(settings.queue.confirm_timeout_minutes as i64),
        Duration::seconds(settings.queue.keep_alive_timeout as i64),
        settings.queue.max_job_failures,
    );
    let lost = queue_state.reload(|name, version| registry.has(name, version))?;

    let app = Arc::new(AppState {
        state: queue_state,
        registry,
        email,
        request_secret: settings.queue.request_secret.clone(),
        public_base_url: format!("http://{}", settings.queue_server_address),
    });
    handlers::notify_lost_tasks(&app, lost);

    let liveness = HealthRegistry::new("liveness");
    let queue_liveness = liveness
        .register("queue".to_string(), time::Duration::seconds(60))
        .await;
    queue_liveness.report_healthy().await;

    tokio::spawn(sweeper::sweeper_loop(
        app.clone(),
        settings.queue.keep_alive_interval,
    ));
    tokio::spawn(sweeper::registry_rescan_loop(
        app.clone(),
        model_dir,
        settings.queue.model_scan_interval,
    ));

    let router = build_router(app)
        .route("/", get(|| async { "dispatch-queue" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route(
            "/_liveness",
            get(move || {
                let liveness = liveness.clone();
                async move { liveness.get_status() }
            }),
        )
        .merge(setup_metrics_router());

    let bind = format!("0.0.0.0:{}", settings.queue.bind_port);
    tracing::info!(%bind, "dispatch-queue listening");

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
