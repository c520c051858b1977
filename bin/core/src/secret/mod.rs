use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use crate::config::SecretProviderConfig;

mod vault;
mod webhook;

/// Uniform interface over pluggable secret backends. Backends only
/// have to implement the single-item [SecretProvider::get]; the
/// bulk operations are shared adapters.
#[async_trait]
pub trait SecretProvider: Send + Sync {
  fn name(&self) -> &'static str;

  /// Resolves one backend-specific reference to its value.
  async fn get(&self, reference: &str) -> anyhow::Result<String>;

  /// Fans out concurrently. The first error wins and the
  /// remaining in-flight lookups are dropped.
  async fn get_many(
    &self,
    references: &[String],
  ) -> anyhow::Result<HashMap<String, String>> {
    let lookups = references.iter().map(|reference| async move {
      let value =
        self.get(reference).await.with_context(|| {
          format!("failed to resolve secret '{reference}'")
        })?;
      anyhow::Ok((reference.clone(), value))
    });
    let resolved = futures::future::try_join_all(lookups).await?;
    Ok(resolved.into_iter().collect())
  }

  /// Resolves a {env var -> reference} mapping to
  /// {env var -> value}. References the backend cannot find are
  /// left out; callers treat a missing mapping as a failure.
  async fn resolve_references(
    &self,
    mapping: &IndexMap<String, String>,
  ) -> anyhow::Result<HashMap<String, String>> {
    let references = mapping
      .values()
      .cloned()
      .collect::<indexmap::IndexSet<_>>()
      .into_iter()
      .collect::<Vec<_>>();
    let values = self.get_many(&references).await?;
    Ok(
      mapping
        .iter()
        .filter_map(|(env, reference)| {
          values
            .get(reference)
            .map(|value| (env.clone(), value.clone()))
        })
        .collect(),
    )
  }

  async fn close(&self) {}
}

/// Constructs the configured backend, None when disabled.
pub fn build_provider(
  config: &SecretProviderConfig,
) -> anyhow::Result<Option<Arc<dyn SecretProvider>>> {
  match config.provider.as_str() {
    "" => Ok(None),
    "vault" => Ok(Some(Arc::new(vault::VaultProvider::new(config)?))),
    "webhook" => {
      Ok(Some(Arc::new(webhook::WebhookProvider::new(config)?)))
    }
    other => anyhow::bail!("unknown secret provider '{other}'"),
  }
}

/// Stable content hash over the resolved secrets: SHA-256 of the
/// sorted `key=value;` concatenation. Equal inputs hash equal
/// regardless of resolution order.
pub fn secrets_hash(secrets: &HashMap<String, String>) -> String {
  let mut pairs = secrets
    .iter()
    .map(|(key, value)| format!("{key}={value};"))
    .collect::<Vec<_>>();
  pairs.sort();
  let mut hasher = Sha256::new();
  for pair in pairs {
    hasher.update(pair.as_bytes());
  }
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn hash_is_permutation_invariant() {
    let a = map(&[("DB_PASS", "x"), ("API_KEY", "y")]);
    let b = map(&[("API_KEY", "y"), ("DB_PASS", "x")]);
    assert_eq!(secrets_hash(&a), secrets_hash(&b));
  }

  #[test]
  fn hash_differs_on_any_change() {
    let a = map(&[("DB_PASS", "x")]);
    assert_ne!(
      secrets_hash(&a),
      secrets_hash(&map(&[("DB_PASS", "y")]))
    );
    assert_ne!(
      secrets_hash(&a),
      secrets_hash(&map(&[("DB_PASS2", "x")]))
    );
    assert_ne!(secrets_hash(&a), secrets_hash(&map(&[])));
  }

  struct Fixed;

  #[async_trait]
  impl SecretProvider for Fixed {
    fn name(&self) -> &'static str {
      "fixed"
    }
    async fn get(&self, reference: &str) -> anyhow::Result<String> {
      match reference {
        "kv:app:db:pass" => Ok(String::from("hunter2")),
        other => anyhow::bail!("unknown reference {other}"),
      }
    }
  }

  #[tokio::test]
  async fn resolve_references_remaps_to_env_names() {
    let mapping = IndexMap::from([
      (
        String::from("DB_PASSWORD"),
        String::from("kv:app:db:pass"),
      ),
      (String::from("MISSING"), String::from("kv:other")),
    ]);
    // Error from the second lookup propagates.
    Fixed.resolve_references(&mapping).await.unwrap_err();

    let mapping = IndexMap::from([(
      String::from("DB_PASSWORD"),
      String::from("kv:app:db:pass"),
    )]);
    let resolved =
      Fixed.resolve_references(&mapping).await.unwrap();
    assert_eq!(
      resolved.get("DB_PASSWORD").map(String::as_str),
      Some("hunter2")
    );
  }
}
