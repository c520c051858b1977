use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

mod gitea;
mod github;
mod gitlab;

pub const ZERO_SHA: &str =
  "0000000000000000000000000000000000000000";

/// Canonical webhook payload, provider differences normalized
/// away.
#[derive(Debug, Clone, Default)]
pub struct ParsedPayload {
  /// Repository short name.
  pub name: String,
  /// `owner/repo`
  pub full_name: String,
  /// The pushed reference, eg `refs/heads/main`.
  pub reference: String,
  /// `branch` or `tag`.
  pub ref_type: String,
  pub before: String,
  pub after: String,
  pub commit_sha: String,
  pub clone_url: String,
  pub web_url: String,
  pub private: bool,
}

#[derive(Debug)]
pub enum WebhookEvent {
  Push(ParsedPayload),
  /// A branch or tag was deleted at the remote. Never deploys.
  Deletion(ParsedPayload),
  /// Acknowledged without action, eg ping events.
  Ignored(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
  /// 404
  #[error("unknown webhook provider '{0}'")]
  UnknownProvider(String),
  /// 404
  #[error("missing event header '{0}'")]
  EventNotFound(&'static str),
  /// 501
  #[error("unsupported event '{0}'")]
  UnsupportedEvent(String),
  /// 401
  #[error("webhook authentication failed")]
  Unauthorized,
  /// 500
  #[error("failed to parse webhook payload | {0}")]
  Parse(String),
}

/// One registration per provider: the event-typing header plus
/// verification and payload classification.
trait Integration {
  const EVENT_HEADER: &'static str;

  fn verify(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
  ) -> Result<(), WebhookError>;

  fn parse(
    event: &str,
    body: &[u8],
  ) -> Result<WebhookEvent, WebhookError>;
}

/// Authenticates and normalizes one inbound webhook request.
pub fn handle(
  provider: &str,
  headers: &HeaderMap,
  body: &[u8],
  secret: &str,
) -> Result<WebhookEvent, WebhookError> {
  match provider {
    "github" => handle_as::<github::Github>(headers, body, secret),
    "gitlab" => handle_as::<gitlab::Gitlab>(headers, body, secret),
    "gitea" => handle_as::<gitea::Gitea>(headers, body, secret),
    "gogs" => handle_as::<gitea::Gogs>(headers, body, secret),
    "forgejo" => {
      handle_as::<gitea::Forgejo>(headers, body, secret)
    }
    other => Err(WebhookError::UnknownProvider(other.to_string())),
  }
}

fn handle_as<I: Integration>(
  headers: &HeaderMap,
  body: &[u8],
  secret: &str,
) -> Result<WebhookEvent, WebhookError> {
  let event = headers
    .get(I::EVENT_HEADER)
    .and_then(|value| value.to_str().ok())
    .ok_or(WebhookError::EventNotFound(I::EVENT_HEADER))?
    .to_string();
  I::verify(headers, body, secret)?;
  I::parse(&event, body)
}

/// HMAC-SHA256 verification against a hex signature,
/// constant time.
fn verify_sha256_signature(
  secret: &str,
  body: &[u8],
  signature_hex: &str,
) -> Result<(), WebhookError> {
  let signature = hex::decode(signature_hex.trim())
    .map_err(|_| WebhookError::Unauthorized)?;
  let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
    .map_err(|_| WebhookError::Unauthorized)?;
  mac.update(body);
  mac
    .verify_slice(&signature)
    .map_err(|_| WebhookError::Unauthorized)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
  a.len() == b.len()
    && a
      .iter()
      .zip(b)
      .fold(0u8, |acc, (x, y)| acc | (x ^ y))
      == 0
}

fn header_str<'a>(
  headers: &'a HeaderMap,
  name: &str,
) -> Option<&'a str> {
  headers.get(name).and_then(|value| value.to_str().ok())
}

/// `refs/tags/...` is a tag, everything else a branch.
fn ref_type_of(reference: &str) -> String {
  if reference.starts_with("refs/tags/") {
    String::from("tag")
  } else {
    String::from("branch")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
      Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
  }

  const GITHUB_PUSH: &str = r#"{
    "ref": "refs/heads/main",
    "before": "1111111111111111111111111111111111111111",
    "after": "2222222222222222222222222222222222222222",
    "repository": {
      "name": "app",
      "full_name": "acme/app",
      "clone_url": "https://github.com/acme/app.git",
      "html_url": "https://github.com/acme/app",
      "private": true
    }
  }"#;

  #[test]
  fn github_push_verifies_and_normalizes() {
    let secret = "hunter2";
    let mut headers = HeaderMap::new();
    headers
      .insert("x-github-event", "push".parse().unwrap());
    headers.insert(
      "x-hub-signature-256",
      format!("sha256={}", sign(secret, GITHUB_PUSH.as_bytes()))
        .parse()
        .unwrap(),
    );
    let event = handle(
      "github",
      &headers,
      GITHUB_PUSH.as_bytes(),
      secret,
    )
    .unwrap();
    let WebhookEvent::Push(payload) = event else {
      panic!("expected push, got {event:?}");
    };
    assert_eq!(payload.full_name, "acme/app");
    assert_eq!(payload.reference, "refs/heads/main");
    assert_eq!(payload.ref_type, "branch");
    assert_eq!(
      payload.commit_sha,
      "2222222222222222222222222222222222222222"
    );
    assert_eq!(
      payload.clone_url,
      "https://github.com/acme/app.git"
    );
    assert!(payload.private);
  }

  #[test]
  fn github_bad_signature_is_unauthorized() {
    let mut headers = HeaderMap::new();
    headers
      .insert("x-github-event", "push".parse().unwrap());
    headers.insert(
      "x-hub-signature-256",
      format!(
        "sha256={}",
        sign("wrong-secret", GITHUB_PUSH.as_bytes())
      )
      .parse()
      .unwrap(),
    );
    let err = handle(
      "github",
      &headers,
      GITHUB_PUSH.as_bytes(),
      "hunter2",
    )
    .unwrap_err();
    assert!(matches!(err, WebhookError::Unauthorized));
  }

  #[test]
  fn github_zero_after_push_is_deletion() {
    let secret = "hunter2";
    let body = GITHUB_PUSH.replace(
      "2222222222222222222222222222222222222222",
      ZERO_SHA,
    );
    let mut headers = HeaderMap::new();
    headers
      .insert("x-github-event", "push".parse().unwrap());
    headers.insert(
      "x-hub-signature-256",
      format!("sha256={}", sign(secret, body.as_bytes()))
        .parse()
        .unwrap(),
    );
    let event =
      handle("github", &headers, body.as_bytes(), secret).unwrap();
    assert!(matches!(event, WebhookEvent::Deletion(_)));
  }

  #[test]
  fn missing_event_header_is_not_found() {
    let headers = HeaderMap::new();
    let err =
      handle("github", &headers, b"{}", "secret").unwrap_err();
    assert!(matches!(err, WebhookError::EventNotFound(_)));
  }

  #[test]
  fn unknown_provider_rejected() {
    let headers = HeaderMap::new();
    let err =
      handle("bitbucket", &headers, b"{}", "secret").unwrap_err();
    assert!(matches!(err, WebhookError::UnknownProvider(_)));
  }

  #[test]
  fn gitlab_token_must_match() {
    let body = r#"{
      "object_kind": "push",
      "ref": "refs/heads/main",
      "before": "1111111111111111111111111111111111111111",
      "after": "2222222222222222222222222222222222222222",
      "checkout_sha": "2222222222222222222222222222222222222222",
      "project": {
        "name": "app",
        "path_with_namespace": "acme/app",
        "git_http_url": "https://gitlab.com/acme/app.git",
        "web_url": "https://gitlab.com/acme/app",
        "visibility_level": 0
      }
    }"#;
    let mut headers = HeaderMap::new();
    headers
      .insert("x-gitlab-event", "Push Hook".parse().unwrap());
    headers
      .insert("x-gitlab-token", "hunter2".parse().unwrap());
    let event =
      handle("gitlab", &headers, body.as_bytes(), "hunter2")
        .unwrap();
    let WebhookEvent::Push(payload) = event else {
      panic!("expected push");
    };
    assert_eq!(payload.full_name, "acme/app");
    assert!(payload.private);

    headers.insert(
      "x-gitlab-token",
      "wrong".parse().unwrap(),
    );
    let err = handle("gitlab", &headers, body.as_bytes(), "hunter2")
      .unwrap_err();
    assert!(matches!(err, WebhookError::Unauthorized));
  }

  #[test]
  fn gitlab_deleted_branch_flagged() {
    let body = format!(
      r#"{{
      "object_kind": "push",
      "ref": "refs/heads/gone",
      "before": "1111111111111111111111111111111111111111",
      "after": "{ZERO_SHA}",
      "checkout_sha": null,
      "project": {{
        "name": "app",
        "path_with_namespace": "acme/app",
        "git_http_url": "https://gitlab.com/acme/app.git",
        "web_url": "https://gitlab.com/acme/app",
        "visibility_level": 20
      }}
    }}"#
    );
    let mut headers = HeaderMap::new();
    headers
      .insert("x-gitlab-event", "Push Hook".parse().unwrap());
    headers
      .insert("x-gitlab-token", "hunter2".parse().unwrap());
    let event =
      handle("gitlab", &headers, body.as_bytes(), "hunter2")
        .unwrap();
    assert!(matches!(event, WebhookEvent::Deletion(_)));
  }

  #[test]
  fn gitea_delete_event_flagged() {
    let secret = "hunter2";
    let body = r#"{
      "ref": "feature-x",
      "ref_type": "branch",
      "repository": {
        "name": "app",
        "full_name": "acme/app",
        "clone_url": "https://gitea.local/acme/app.git",
        "html_url": "https://gitea.local/acme/app",
        "private": false
      }
    }"#;
    let mut headers = HeaderMap::new();
    headers
      .insert("x-gitea-event", "delete".parse().unwrap());
    headers.insert(
      "x-gitea-signature",
      sign(secret, body.as_bytes()).parse().unwrap(),
    );
    let event =
      handle("gitea", &headers, body.as_bytes(), secret).unwrap();
    let WebhookEvent::Deletion(payload) = event else {
      panic!("expected deletion");
    };
    assert_eq!(payload.ref_type, "branch");
  }

  #[test]
  fn unsupported_event_is_distinct() {
    let secret = "hunter2";
    let body = b"{}";
    let mut headers = HeaderMap::new();
    headers
      .insert("x-github-event", "issues".parse().unwrap());
    headers.insert(
      "x-hub-signature-256",
      format!("sha256={}", sign(secret, body))
        .parse()
        .unwrap(),
    );
    let err =
      handle("github", &headers, body, secret).unwrap_err();
    assert!(matches!(err, WebhookError::UnsupportedEvent(_)));
  }
}
