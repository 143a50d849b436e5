//! The web frontend: a stateless HTTP handler that validates form input
//! against a model's declared schema and forwards `create`/`confirm`
//! requests to the queue daemon over HTTP, the same way the worker
//! driver forwards its own requests. Structurally mirrors
//! `hook-api::main`: a `clap`-configured binary serving one router with
//! a Prometheus metrics endpoint merged in.

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::limit::RequestBodyLimitLayer;

use dispatch_common::config::{load_settings, CommonArgs};
use dispatch_common::health::HealthRegistry;
use dispatch_common::metrics::setup_metrics_router;
use dispatch_common::registry::ModelRegistry;

mod error;
mod forms;
mod handlers;
mod templates;

pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub client: reqwest::Client,
    pub queue_base_url: String,
    pub request_secret: String,
}

const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn build_router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/models/:name", get(handlers::show_model))
        .route(
            "/submit",
            post(handlers::submit).layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .route("/confirm_submission/:code", get(handlers::confirm))
        .with_state(app)
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = CommonArgs::parse();
    args.init_logging()?;

    let settings = load_settings(&args.config, args.port)?;

    let registry = Arc::new(ModelRegistry::new());
    let model_dir = PathBuf::from(&settings.rendering.model_directory);
    registry.scan_directory(&model_dir)?;

    let app = Arc::new(AppState {
        registry: registry.clone(),
        client: reqwest::Client::new(),
        queue_base_url: format!("http://{}", settings.queue_server_address),
        request_secret: settings.queue.request_secret.clone(),
    });

    let rescan_interval = std::time::Duration::from_secs(settings.queue.model_scan_interval);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(rescan_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = registry.scan_directory(&model_dir) {
                tracing::warn!(error = %err, "model registry rescan failed");
            }
        }
    });

    let liveness = HealthRegistry::new("liveness");
    let web_liveness = liveness
        .register("web".to_string(), time::Duration::seconds(60))
        .await;
    web_liveness.report_healthy().await;

    let router = build_router(app)
        .route("/_readiness", get(|| async { "ok" }))
        .route(
            "/_liveness",
            get(move || {
                let liveness = liveness.clone();
                async move { liveness.get_status() }
            }),
        )
        .merge(setup_metrics_router());

    let bind = format!("0.0.0.0:{}", settings.web.bind_port);
    tracing::info!(%bind, "dispatch-web listening");

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
