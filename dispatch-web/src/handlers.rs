//! Thin request-forwarding surface (§6): validate a form submission
//! against the model's own schema, forward the resulting task dict to
//! the queue daemon's `/client_model_create`, and forward confirmation
//! clicks to `/client_confirm/{code}`. No state of its own beyond the
//! model registry it shares with the other two daemons.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Form, Path, State};
use axum::response::{Html, IntoResponse, Response};
use serde_json::{json, Value};

use crate::error::WebError;
use crate::forms::task_dict_from_form;
use crate::templates::{escape_html, render_message, render_model_form, render_model_index};
use crate::AppState;

pub async fn index(State(app): State<Arc<AppState>>) -> Html<String> {
    let models: Vec<(String, String)> = app
        .registry
        .model_names()
        .into_iter()
        .filter_map(|name| {
            app.registry
                .get_latest(&name)
                .map(|def| (def.short_name.clone(), def.subtitle.clone()))
        })
        .collect();
    Html(render_model_index(&models))
}

pub async fn show_model(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Html<String>, WebError> {
    let definition = app
        .registry
        .get_latest(&name)
        .ok_or_else(|| WebError::UnknownModel(name.clone()))?;
    Ok(Html(render_model_form(&definition, None)))
}

pub async fn submit(
    State(app): State<Arc<AppState>>,
    Form(mut fields): Form<HashMap<String, String>>,
) -> Result<Html<String>, WebError> {
    let model_name = fields.remove("model_name").unwrap_or_default();
    let model_version = fields.remove("model_version");
    let email_address = fields
        .remove("email_address")
        .ok_or_else(|| WebError::UnknownModel(model_name.clone()))?;

    let definition = match model_version.as_deref() {
        Some(version) => app.registry.get(&model_name, version),
        None => app.registry.get_latest(&model_name),
    }
    .ok_or_else(|| WebError::UnknownModel(model_name.clone()))?;

    let dict = match task_dict_from_form(&definition, email_address.clone(), &fields) {
        Ok(dict) => dict,
        Err(err) => return Ok(Html(render_model_form(&definition, Some(&err.to_string())))),
    };

    let response: Value = app
        .client
        .post(format!("{}/client_model_create", app.queue_base_url))
        .query(&[("secret", &app.request_secret)])
        .json(&json!({ "task_json": dict }))
        .send()
        .await?
        .json()
        .await?;

    if response.get("code").is_none() {
        return Err(WebError::MalformedResponse(response.to_string()));
    }

    Ok(Html(render_message(
        "Check your email",
        &format!(
            "A confirmation link has been sent to {}.",
            escape_html(&email_address)
        ),
    )))
}

pub async fn confirm(
    State(app): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Response, WebError> {
    let response = app
        .client
        .get(format!("{}/client_confirm/{code}", app.queue_base_url))
        .query(&[("secret", &app.request_secret)])
        .send()
        .await?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok((
            axum::http::StatusCode::NOT_FOUND,
            Html(render_message(
                "Confirmation not found",
                "This confirmation link has expired or does not exist.",
            )),
        )
            .into_response());
    }

    let body: Value = response.json().await?;
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| WebError::MalformedResponse(body.to_string()))?;

    let message = match status {
        "confirmed" => "Your model run has been confirmed and is now queued.",
        "already_confirmed" => "This model run was already confirmed.",
        other => return Err(WebError::MalformedResponse(other.to_owned())),
    };

    Ok(Html(render_message("Confirmed", message)).into_response())
}
