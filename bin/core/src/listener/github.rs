use axum::http::HeaderMap;
use serde::Deserialize;

use super::{
  Integration, ParsedPayload, WebhookError, WebhookEvent, ZERO_SHA,
  header_str, ref_type_of, verify_sha256_signature,
};

pub struct Github;

#[derive(Deserialize)]
struct PushPayload {
  #[serde(rename = "ref")]
  reference: String,
  #[serde(default)]
  before: String,
  #[serde(default)]
  after: String,
  repository: Repository,
}

#[derive(Deserialize)]
struct DeletePayload {
  #[serde(rename = "ref")]
  reference: String,
  ref_type: String,
  repository: Repository,
}

#[derive(Deserialize)]
struct Repository {
  name: String,
  full_name: String,
  clone_url: String,
  #[serde(default)]
  html_url: String,
  #[serde(default)]
  private: bool,
}

impl Repository {
  fn apply(self, payload: &mut ParsedPayload) {
    payload.name = self.name;
    payload.full_name = self.full_name;
    payload.clone_url = self.clone_url;
    payload.web_url = self.html_url;
    payload.private = self.private;
  }
}

impl Integration for Github {
  const EVENT_HEADER: &'static str = "x-github-event";

  fn verify(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
  ) -> Result<(), WebhookError> {
    let signature =
      header_str(headers, "x-hub-signature-256")
        .ok_or(WebhookError::Unauthorized)?
        .strip_prefix("sha256=")
        .ok_or(WebhookError::Unauthorized)?;
    verify_sha256_signature(secret, body, signature)
  }

  fn parse(
    event: &str,
    body: &[u8],
  ) -> Result<WebhookEvent, WebhookError> {
    match event {
      "push" => {
        let push: PushPayload = serde_json::from_slice(body)
          .map_err(|e| WebhookError::Parse(e.to_string()))?;
        let mut payload = ParsedPayload {
          reference: push.reference.clone(),
          ref_type: ref_type_of(&push.reference),
          before: push.before,
          after: push.after.clone(),
          commit_sha: push.after.clone(),
          ..Default::default()
        };
        push.repository.apply(&mut payload);
        // A push of the zero object id deletes the reference.
        if push.after == ZERO_SHA {
          Ok(WebhookEvent::Deletion(payload))
        } else {
          Ok(WebhookEvent::Push(payload))
        }
      }
      "delete" => {
        let delete: DeletePayload = serde_json::from_slice(body)
          .map_err(|e| WebhookError::Parse(e.to_string()))?;
        if delete.ref_type != "branch" && delete.ref_type != "tag" {
          return Err(WebhookError::UnsupportedEvent(format!(
            "delete {}",
            delete.ref_type
          )));
        }
        let mut payload = ParsedPayload {
          reference: delete.reference,
          ref_type: delete.ref_type,
          after: ZERO_SHA.to_string(),
          ..Default::default()
        };
        delete.repository.apply(&mut payload);
        Ok(WebhookEvent::Deletion(payload))
      }
      "ping" => Ok(WebhookEvent::Ignored("ping")),
      other => {
        Err(WebhookError::UnsupportedEvent(other.to_string()))
      }
    }
  }
}
