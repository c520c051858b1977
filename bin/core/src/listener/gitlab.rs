use axum::http::HeaderMap;
use serde::Deserialize;

use super::{
  Integration, ParsedPayload, WebhookError, WebhookEvent, ZERO_SHA,
  constant_time_eq, header_str, ref_type_of,
};

pub struct Gitlab;

#[derive(Deserialize)]
struct PushPayload {
  #[serde(rename = "ref")]
  reference: String,
  #[serde(default)]
  before: String,
  #[serde(default)]
  after: String,
  checkout_sha: Option<String>,
  project: Project,
}

#[derive(Deserialize)]
struct Project {
  name: String,
  path_with_namespace: String,
  git_http_url: String,
  #[serde(default)]
  web_url: String,
  /// 0 private, 10 internal, 20 public.
  #[serde(default)]
  visibility_level: i64,
}

impl Integration for Gitlab {
  const EVENT_HEADER: &'static str = "x-gitlab-event";

  /// GitLab sends the shared secret verbatim instead of signing
  /// the body.
  fn verify(
    headers: &HeaderMap,
    _body: &[u8],
    secret: &str,
  ) -> Result<(), WebhookError> {
    let token = header_str(headers, "x-gitlab-token")
      .ok_or(WebhookError::Unauthorized)?;
    if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
      Ok(())
    } else {
      Err(WebhookError::Unauthorized)
    }
  }

  fn parse(
    event: &str,
    body: &[u8],
  ) -> Result<WebhookEvent, WebhookError> {
    match event {
      "Push Hook" | "Tag Push Hook" => {
        let push: PushPayload = serde_json::from_slice(body)
          .map_err(|e| WebhookError::Parse(e.to_string()))?;
        let deleted =
          push.after == ZERO_SHA && push.checkout_sha.is_none();
        let payload = ParsedPayload {
          name: push.project.name,
          full_name: push.project.path_with_namespace,
          ref_type: ref_type_of(&push.reference),
          reference: push.reference,
          before: push.before,
          commit_sha: push
            .checkout_sha
            .unwrap_or_else(|| push.after.clone()),
          after: push.after,
          clone_url: push.project.git_http_url,
          web_url: push.project.web_url,
          private: push.project.visibility_level < 20,
        };
        if deleted {
          Ok(WebhookEvent::Deletion(payload))
        } else {
          Ok(WebhookEvent::Push(payload))
        }
      }
      other => {
        Err(WebhookError::UnsupportedEvent(other.to_string()))
      }
    }
  }
}
