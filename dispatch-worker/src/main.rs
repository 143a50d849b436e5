//! The worker driver: a single-task-at-a-time polling loop against the
//! queue daemon's HTTP surface, plus a side metrics/health listener the
//! same way `hook-worker::main` spawns one alongside its poll loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;

use dispatch_common::config::{load_settings, CommonArgs};
use dispatch_common::email::SmtpConfig;
use dispatch_common::health::HealthRegistry;
use dispatch_common::metrics::{serve, setup_metrics_router};
use dispatch_common::registry::ModelRegistry;

mod error;
mod run;
mod worker;

use worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = CommonArgs::parse();
    args.init_logging()?;

    let settings = load_settings(&args.config, args.port)?;

    let registry = Arc::new(ModelRegistry::new());
    let model_dir = PathBuf::from(&settings.rendering.model_directory);
    registry.scan_directory(&model_dir)?;

    let smtp = SmtpConfig {
        server: settings.email.smtp_server.clone(),
        port: settings.email.smtp_port,
        username: settings.email.smtp_username.clone(),
        password: settings.email.smtp_password.clone(),
        use_tls: settings.email.use_tls,
        from_address: settings.email.from_address.clone(),
        cc: settings.email.cc.clone(),
        bcc: settings.email.bcc.clone(),
    };

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    let worker = Worker::new(
        registry.clone(),
        smtp,
        WorkerConfig {
            base_url: format!("http://{}", settings.queue_server_address),
            request_secret: settings.queue.request_secret.clone(),
            poll_interval: Duration::from_secs(settings.worker.poll_interval_seconds),
            heartbeat_interval: Duration::from_secs(settings.worker.heartbeat_interval_seconds),
            working_directory_root: PathBuf::from(&settings.worker.working_directory_root),
            latex_path: settings.rendering.latex_path.clone(),
            latex_num_runs: settings.rendering.latex_num_runs,
        },
        worker_liveness,
    );

    worker.check_connectivity().await?;

    let rescan_interval = Duration::from_secs(settings.queue.model_scan_interval);
    let bind_port = settings.worker.bind_port;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(rescan_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = registry.scan_directory(&model_dir) {
                tracing::warn!(error = %err, "model registry rescan failed");
            }
        }
    });

    let router = Router::new()
        .route("/", get(|| async { "dispatch-worker" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route(
            "/_liveness",
            get(move || {
                let liveness = liveness.clone();
                async move { liveness.get_status() }
            }),
        )
        .merge(setup_metrics_router());

    let bind = format!("0.0.0.0:{}", settings.worker.bind_port);
    tokio::spawn(async move {
        if let Err(err) = serve(router, &bind).await {
            tracing::error!(error = %err, "metrics/health listener exited");
        }
    });

    worker.run().await;
}
