//! Background loops: the heartbeat-expiry sweeper and the model registry
//! rescanner. Both are structured like `hook-janitor`'s `cleanup_loop` —
//! a `tokio::time::interval` guarded by a single-permit semaphore so a
//! slow iteration can't overlap the next tick, logging and continuing on
//! any error rather than aborting the loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use dispatch_common::email::OutgoingEmail;

use crate::AppState;

fn sweeper_failure_email(task: &dispatch_common::task::Task) -> OutgoingEmail {
    OutgoingEmail::simple(
        &task.email_address,
        "Your model run failed",
        format!(
            "Your model run '{}' (id {}) stopped reporting progress and will not be \
             retried after {} attempts.",
            task.model_name, task.visible_id, task.failure_count
        ),
    )
}

pub async fn sweeper_loop(app: Arc<AppState>, interval_secs: u64) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;

        match app.state.sweep_expired() {
            Ok(outcomes) if !outcomes.is_empty() => {
                tracing::info!(count = outcomes.len(), "swept expired in-flight tasks");
                for outcome in outcomes {
                    if let Err(failed) = outcome {
                        app.email.enqueue(sweeper_failure_email(&failed));
                    }
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "failed to persist after sweep"),
        }
    }
}

pub async fn registry_rescan_loop(app: Arc<AppState>, model_dir: PathBuf, interval_secs: u64) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;

        match app.registry.scan_directory(&model_dir) {
            Ok(loaded) if loaded > 0 => {
                tracing::info!(loaded, "model registry rescan loaded new definitions")
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "model registry rescan failed"),
        }
    }
}
