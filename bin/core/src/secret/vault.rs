use std::{path::PathBuf, time::Duration};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::SecretProvider;
use crate::config::SecretProviderConfig;

/// Key-value (v2) and PKI secret engines over HTTP.
///
/// Reference formats:
///   `kv:[namespace:]engine:name:key`
///   `pki:[namespace:]engine:commonName`
pub struct VaultProvider {
  address: String,
  namespace: Option<String>,
  token: RwLock<String>,
  token_file: Option<PathBuf>,
  client: reqwest::Client,
}

impl VaultProvider {
  pub fn new(
    config: &SecretProviderConfig,
  ) -> anyhow::Result<VaultProvider> {
    let token = match (&config.token, &config.token_file) {
      (Some(_), Some(_)) => anyhow::bail!(
        "both SECRET_PROVIDER_TOKEN and SECRET_PROVIDER_TOKEN_FILE are set"
      ),
      (Some(token), None) => token.clone(),
      (None, Some(file)) => read_token_file(file)?,
      (None, None) => {
        anyhow::bail!(
          "SECRET_PROVIDER_TOKEN (or SECRET_PROVIDER_TOKEN_FILE) is required for vault"
        )
      }
    };
    Ok(VaultProvider {
      address: config.address.trim_end_matches('/').to_string(),
      namespace: config.namespace.clone(),
      token: RwLock::new(token),
      token_file: config.token_file.clone(),
      client: reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .context("failed to build vault http client")?,
    })
  }

  async fn request(
    &self,
    reference: &ParsedRef,
  ) -> anyhow::Result<reqwest::Response> {
    let path = match reference {
      ParsedRef::Kv { engine, name, .. } => format!(
        "{}/v1/{}/data/{}",
        self.address,
        urlencoding::encode(engine),
        name
          .split('/')
          .map(|part| urlencoding::encode(part).into_owned())
          .collect::<Vec<_>>()
          .join("/"),
      ),
      ParsedRef::Pki { engine, common_name } => format!(
        "{}/v1/{}/issue/{}",
        self.address,
        urlencoding::encode(engine),
        urlencoding::encode(common_name),
      ),
    };
    let token = self.token.read().await.clone();
    let mut request = match reference {
      ParsedRef::Kv { .. } => self.client.get(&path),
      ParsedRef::Pki { common_name, .. } => self
        .client
        .post(&path)
        .json(&serde_json::json!({ "common_name": common_name })),
    };
    request = request.header("X-Vault-Token", token);
    let namespace = reference
      .namespace()
      .map(str::to_string)
      .or_else(|| self.namespace.clone());
    if let Some(namespace) = namespace {
      request = request.header("X-Vault-Namespace", namespace);
    }
    request
      .send()
      .await
      .context("vault request failed to send")
  }

  /// Re-reads the token from file, supporting rotated tokens.
  /// Only possible when the token came from a file.
  async fn reauth(&self) -> bool {
    let Some(file) = &self.token_file else {
      return false;
    };
    match read_token_file(file) {
      Ok(fresh) => {
        let mut token = self.token.write().await;
        let changed = *token != fresh;
        *token = fresh;
        changed
      }
      Err(e) => {
        warn!("failed to re-read vault token | {e:#}");
        false
      }
    }
  }

  async fn get_inner(
    &self,
    reference: &ParsedRef,
  ) -> anyhow::Result<String> {
    let response = self.request(reference).await?;
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(
        anyhow!("{body}")
          .context(format!("vault returned {status}")),
      );
    }
    let body: serde_json::Value = response
      .json()
      .await
      .context("vault response is not json")?;
    let value = match reference {
      ParsedRef::Kv { key, .. } => body
        .pointer(&format!("/data/data/{key}"))
        .and_then(serde_json::Value::as_str)
        .with_context(|| {
          format!("vault response has no value at data.data.{key}")
        })?,
      ParsedRef::Pki { .. } => body
        .pointer("/data/certificate")
        .and_then(serde_json::Value::as_str)
        .context("vault response has no certificate")?,
    };
    Ok(value.to_string())
  }
}

#[async_trait]
impl SecretProvider for VaultProvider {
  fn name(&self) -> &'static str {
    "vault"
  }

  async fn get(&self, reference: &str) -> anyhow::Result<String> {
    let parsed = ParsedRef::parse(reference)?;
    match self.get_inner(&parsed).await {
      Ok(value) => Ok(value),
      Err(e) if is_invalid_token(&e) && self.reauth().await => {
        self.get_inner(&parsed).await
      }
      Err(e) => Err(e),
    }
  }
}

/// Permission failures that a fresh token can fix.
fn is_invalid_token(e: &anyhow::Error) -> bool {
  let text = format!("{e:#}").to_lowercase();
  text.contains("invalid client token")
    || text.contains("permission denied")
    || text.contains("403")
}

fn read_token_file(file: &PathBuf) -> anyhow::Result<String> {
  let token = std::fs::read_to_string(file).with_context(|| {
    format!("failed to read vault token from {file:?}")
  })?;
  Ok(token.trim().to_string())
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedRef {
  Kv {
    namespace: Option<String>,
    engine: String,
    name: String,
    key: String,
  },
  Pki {
    engine: String,
    common_name: String,
  },
}

impl ParsedRef {
  fn parse(reference: &str) -> anyhow::Result<ParsedRef> {
    let parts = reference.split(':').collect::<Vec<_>>();
    match parts.as_slice() {
      ["kv", engine, name, key] => Ok(ParsedRef::Kv {
        namespace: None,
        engine: engine.to_string(),
        name: name.to_string(),
        key: key.to_string(),
      }),
      ["kv", namespace, engine, name, key] => Ok(ParsedRef::Kv {
        namespace: Some(namespace.to_string()),
        engine: engine.to_string(),
        name: name.to_string(),
        key: key.to_string(),
      }),
      ["pki", engine, common_name]
      | ["pki", _, engine, common_name] => Ok(ParsedRef::Pki {
        engine: engine.to_string(),
        common_name: common_name.to_string(),
      }),
      _ => Err(anyhow!(
        "invalid vault reference '{reference}', expected kv:[ns:]engine:name:key or pki:[ns:]engine:commonName"
      )),
    }
  }

  fn namespace(&self) -> Option<&str> {
    match self {
      ParsedRef::Kv { namespace, .. } => namespace.as_deref(),
      ParsedRef::Pki { .. } => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_kv_references() {
    assert_eq!(
      ParsedRef::parse("kv:apps:web:db_password").unwrap(),
      ParsedRef::Kv {
        namespace: None,
        engine: String::from("apps"),
        name: String::from("web"),
        key: String::from("db_password"),
      }
    );
    assert_eq!(
      ParsedRef::parse("kv:team-a:apps:web:db_password").unwrap(),
      ParsedRef::Kv {
        namespace: Some(String::from("team-a")),
        engine: String::from("apps"),
        name: String::from("web"),
        key: String::from("db_password"),
      }
    );
  }

  #[test]
  fn parses_pki_references() {
    assert_eq!(
      ParsedRef::parse("pki:intermediate:web.acme.io").unwrap(),
      ParsedRef::Pki {
        engine: String::from("intermediate"),
        common_name: String::from("web.acme.io"),
      }
    );
  }

  #[test]
  fn rejects_malformed_references() {
    ParsedRef::parse("kv:only:three").unwrap_err();
    ParsedRef::parse("gcp:project:secret").unwrap_err();
    ParsedRef::parse("").unwrap_err();
  }
}
