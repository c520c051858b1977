use axum::{
  Router,
  body::Bytes,
  extract::Path,
  http::{HeaderMap, StatusCode},
  response::IntoResponse,
  routing::{get, post},
};
use serde_json::json;
use serror::AddStatusCodeError;

use crate::{
  config::core_config,
  dispatch::{self, RunSummary},
  listener::{self, WebhookError, WebhookEvent},
  stage::JobOutcome,
};

pub fn router() -> Router {
  Router::new()
    .route("/v1/webhook/{provider}", post(webhook_handler))
    .route("/v1/deployments", get(list_deployments))
    .route("/v1/deployments/{stack}", get(get_deployment))
    .route("/v1/health", get(health))
    .route("/metrics", get(crate::metrics::handler))
}

async fn health() -> axum::Json<serde_json::Value> {
  axum::Json(json!({ "status": "ok" }))
}

/// Read surface: the compose projects currently carrying the
/// manager label, with their stamped deployment metadata.
async fn list_deployments(
  headers: HeaderMap,
) -> serror::Result<axum::response::Response> {
  check_api_key(&headers)?;
  let stacks =
    crate::docker::docker_client().managed_stacks().await?;
  Ok(axum::Json(stacks).into_response())
}

async fn get_deployment(
  Path(stack): Path<String>,
  headers: HeaderMap,
) -> serror::Result<axum::response::Response> {
  check_api_key(&headers)?;
  let stacks =
    crate::docker::docker_client().managed_stacks().await?;
  match stacks.into_iter().find(|entry| entry.name == stack) {
    Some(entry) => Ok(axum::Json(entry).into_response()),
    None => Err(
      anyhow::anyhow!("no managed stack named '{stack}'")
        .status_code(StatusCode::NOT_FOUND),
    ),
  }
}

#[instrument(name = "Webhook", level = "debug", skip(headers, body))]
async fn webhook_handler(
  Path(provider): Path<String>,
  headers: HeaderMap,
  body: Bytes,
) -> serror::Result<axum::response::Response> {
  check_api_key(&headers)?;

  let event = listener::handle(
    &provider,
    &headers,
    &body,
    &core_config().webhook_secret,
  )
  .map_err(webhook_error)?;

  let summary = match event {
    WebhookEvent::Ignored(reason) => {
      return Ok(
        axum::Json(json!({ "status": "ignored", "reason": reason }))
          .into_response(),
      );
    }
    WebhookEvent::Push(payload) => {
      dispatch::reconcile_webhook(payload, false).await?
    }
    WebhookEvent::Deletion(payload) => {
      dispatch::reconcile_webhook(payload, true).await?
    }
  };

  Ok(summary_response(summary))
}

fn summary_response(
  summary: RunSummary,
) -> axum::response::Response {
  let results = summary
    .results
    .iter()
    .map(|result| {
      let outcome = match &result.outcome {
        Ok(JobOutcome::Completed) => String::from("completed"),
        Ok(JobOutcome::Skipped(reason)) => {
          format!("skipped: {reason}")
        }
        Err(e) => format!("failed: {e:#}"),
      };
      json!({ "stack": result.stack, "result": outcome })
    })
    .collect::<Vec<_>>();
  let status = if summary.failed() > 0 {
    "completed_with_errors"
  } else {
    "completed"
  };
  axum::Json(json!({
    "repository": summary.repository,
    "status": status,
    "results": results,
  }))
  .into_response()
}

/// When an API secret is configured, `x-api-key` must be present
/// and equal. Without one, every request is accepted.
fn check_api_key(
  headers: &HeaderMap,
) -> Result<(), serror::Error> {
  let Some(expected) = &core_config().api_secret else {
    return Ok(());
  };
  let provided = headers
    .get("x-api-key")
    .and_then(|value| value.to_str().ok())
    .unwrap_or_default();
  let expected = expected.as_bytes();
  let provided = provided.as_bytes();
  let equal = expected.len() == provided.len()
    && expected
      .iter()
      .zip(provided)
      .fold(0u8, |acc, (a, b)| acc | (a ^ b))
      == 0;
  if equal {
    Ok(())
  } else {
    Err(
      anyhow::anyhow!("invalid api key")
        .status_code(StatusCode::UNAUTHORIZED),
    )
  }
}

fn webhook_error(e: WebhookError) -> serror::Error {
  let status = match &e {
    WebhookError::UnknownProvider(_)
    | WebhookError::EventNotFound(_) => StatusCode::NOT_FOUND,
    WebhookError::UnsupportedEvent(_) => {
      StatusCode::NOT_IMPLEMENTED
    }
    WebhookError::Unauthorized => StatusCode::UNAUTHORIZED,
    WebhookError::Parse(_) => StatusCode::INTERNAL_SERVER_ERROR,
  };
  anyhow::Error::from(e).status_code(status)
}
