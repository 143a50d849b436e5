//! The queue daemon's HTTP surface (§4.2). A shared `secret` query
//! parameter authenticates every request; axum extractors keep each
//! handler to "pull state, mutate, respond" with the auth check and the
//! secret comparison running once per request via `check_secret`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use dispatch_common::email::OutgoingEmail;
use dispatch_common::secret;
use dispatch_common::task::{Task, TaskDict, TaskId};

use crate::error::QueueError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SecretQuery {
    pub secret: Option<String>,
}

fn check_secret(app: &AppState, query: &SecretQuery) -> Result<(), QueueError> {
    if secret::matches(&app.request_secret, query.secret.as_deref()) {
        Ok(())
    } else {
        Err(QueueError::BadSecret)
    }
}

fn confirmation_email(app: &AppState, task: &Task, code: &str) -> OutgoingEmail {
    let body = format!(
        "Please confirm your model run by visiting {}/confirm_submission/{}. \
         This link expires in {} minutes.",
        app.public_base_url,
        code,
        app.state.confirm_timeout.whole_minutes()
    );
    OutgoingEmail::simple(&task.email_address, "Confirm your model run", body)
}

fn failure_email(task: &Task) -> OutgoingEmail {
    OutgoingEmail::simple(
        &task.email_address,
        "Your model run failed",
        format!(
            "Your model run '{}' (id {}) failed after {} attempts and will not be retried.",
            task.model_name, task.visible_id, task.failure_count
        ),
    )
}

fn lost_task_email(dict: &TaskDict) -> OutgoingEmail {
    OutgoingEmail::simple(
        &dict.email_address,
        "We lost your model run",
        format!(
            "Your model run '{}' (version {}) could not be restored after a restart \
             because that model version is no longer loaded. Please resubmit.",
            dict.model_name, dict.model_version
        ),
    )
}

/// Re-sends "lost your job" notifications for snapshot entries whose
/// `(name, version)` the registry no longer knows about. Called once at
/// startup, after the registry's first scan.
pub fn notify_lost_tasks(app: &AppState, lost: Vec<TaskDict>) {
    for dict in &lost {
        tracing::warn!(
            model = %dict.model_name,
            version = %dict.model_version,
            email = %dict.email_address,
            "discarding snapshot entry for unknown model version"
        );
        app.email.enqueue(lost_task_email(dict));
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub task_json: TaskDict,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub task: TaskDict,
    pub code: String,
}

pub async fn client_model_create(
    State(app): State<Arc<AppState>>,
    Query(query): Query<SecretQuery>,
    Json(request): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, QueueError> {
    check_secret(&app, &query)?;

    let definition = app
        .registry
        .get(&request.task_json.model_name, &request.task_json.model_version)
        .ok_or_else(|| {
            QueueError::InvalidModel(dispatch_common::error::RegistryError::UnknownVersion {
                name: request.task_json.model_name.clone(),
                version: request.task_json.model_version.clone(),
            })
        })?;

    let task = Task::from_submission(request.task_json, &definition.parameters)?;
    let (task, code) = app.state.create(task)?;

    app.email.enqueue(confirmation_email(&app, &task, &code));

    Ok(Json(CreateResponse {
        task: task.to_dict(),
        code,
    }))
}

pub async fn client_confirm(
    State(app): State<Arc<AppState>>,
    Path(code): Path<String>,
    Query(query): Query<SecretQuery>,
) -> Result<axum::response::Response, QueueError> {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use crate::state::ConfirmOutcome;

    check_secret(&app, &query)?;

    let response = match app.state.confirm(&code)? {
        ConfirmOutcome::Confirmed => Json(json!({ "status": "confirmed" })).into_response(),
        ConfirmOutcome::AlreadyConfirmed => {
            Json(json!({ "status": "already_confirmed" })).into_response()
        }
        ConfirmOutcome::NotFound => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" }))).into_response()
        }
    };
    Ok(response)
}

pub async fn client_queue_has_workers(
    State(app): State<Arc<AppState>>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<Value>, QueueError> {
    check_secret(&app, &query)?;
    Ok(Json(json!({ "has_workers": app.state.has_workers() })))
}

pub async fn worker_info(
    State(app): State<Arc<AppState>>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<Value>, QueueError> {
    check_secret(&app, &query)?;
    app.state.touch_worker_checkin();
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct WorkTaskRequest {
    pub model_versions_json: Vec<(String, String)>,
}

pub async fn worker_work_task(
    State(app): State<Arc<AppState>>,
    Query(query): Query<SecretQuery>,
    Json(request): Json<WorkTaskRequest>,
) -> Result<Json<Value>, QueueError> {
    check_secret(&app, &query)?;

    if app.state.pending_len() == 0 {
        return Err(QueueError::EmptyQueue);
    }

    match app.state.pull_for_worker(&request.model_versions_json) {
        Some(task) => Ok(Json(json!({ "task": task.to_dict() }))),
        None => Err(QueueError::NoVersion),
    }
}

pub async fn worker_keep_alive_task(
    State(app): State<Arc<AppState>>,
    Path(task_id): Path<TaskId>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<Value>, QueueError> {
    check_secret(&app, &query)?;
    if app.state.keep_alive(task_id) {
        Ok(Json(json!({ "status": "ok" })))
    } else {
        Err(QueueError::BadId)
    }
}

pub async fn worker_has_task(
    State(app): State<Arc<AppState>>,
    Path(task_id): Path<TaskId>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<Value>, QueueError> {
    check_secret(&app, &query)?;
    let result = if app.state.has_task(task_id) { "yes" } else { "no" };
    Ok(Json(json!({ "result": result })))
}

pub async fn worker_succeed_task(
    State(app): State<Arc<AppState>>,
    Path(task_id): Path<TaskId>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<Value>, QueueError> {
    check_secret(&app, &query)?;
    if app.state.succeed(task_id)? {
        Ok(Json(json!({ "status": "ok" })))
    } else {
        Err(QueueError::BadId)
    }
}

pub async fn worker_failed_task(
    State(app): State<Arc<AppState>>,
    Path(task_id): Path<TaskId>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<Value>, QueueError> {
    check_secret(&app, &query)?;

    match app.state.fail(task_id)? {
        None => Err(QueueError::BadId),
        Some(Ok(_requeued)) => Ok(Json(json!({ "status": "ok" }))),
        Some(Err(failed)) => {
            app.email.enqueue(failure_email(&failed));
            Ok(Json(json!({ "status": "ok" })))
        }
    }
}
