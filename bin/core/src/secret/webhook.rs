use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;

use super::SecretProvider;
use crate::config::SecretProviderConfig;

/// Resolves secrets by calling a user-supplied HTTP endpoint.
/// The reference is rendered into the configured url / body
/// templates via `{reference}`, and a JSON pointer extracts one
/// string from the response.
pub struct WebhookProvider {
  url_template: String,
  method: reqwest::Method,
  body_template: Option<String>,
  value_pointer: String,
  client: reqwest::Client,
}

impl WebhookProvider {
  pub fn new(
    config: &SecretProviderConfig,
  ) -> anyhow::Result<WebhookProvider> {
    let method = config
      .method
      .to_uppercase()
      .parse::<reqwest::Method>()
      .with_context(|| {
        format!("invalid SECRET_PROVIDER_METHOD '{}'", config.method)
      })?;
    Ok(WebhookProvider {
      url_template: config.url.clone(),
      method,
      body_template: config.body.clone(),
      value_pointer: config.value_pointer.clone(),
      client: reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .context("failed to build webhook http client")?,
    })
  }
}

#[async_trait]
impl SecretProvider for WebhookProvider {
  fn name(&self) -> &'static str {
    "webhook"
  }

  async fn get(&self, reference: &str) -> anyhow::Result<String> {
    let url = self.url_template.replace(
      "{reference}",
      &urlencoding::encode(reference),
    );
    let mut request =
      self.client.request(self.method.clone(), &url);
    if let Some(body) = &self.body_template {
      let body = body.replace("{reference}", reference);
      let json: serde_json::Value = serde_json::from_str(&body)
        .context("SECRET_PROVIDER_BODY is not valid json")?;
      request = request.json(&json);
    }
    let response = request
      .send()
      .await
      .with_context(|| format!("request to {url} failed"))?;
    let status = response.status();
    if !status.is_success() {
      return Err(anyhow!(
        "secret endpoint returned {status} for '{reference}'"
      ));
    }
    let body: serde_json::Value = response
      .json()
      .await
      .context("secret endpoint response is not json")?;
    body
      .pointer(&self.value_pointer)
      .and_then(serde_json::Value::as_str)
      .map(str::to_string)
      .with_context(|| {
        format!(
          "no string at pointer '{}' in secret endpoint response",
          self.value_pointer
        )
      })
  }
}
