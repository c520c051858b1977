use std::path::Path;

use anyhow::{Context, anyhow};
use command::run_doco_command_with_sanitization;

use crate::config::core_config;

/// Directory basenames never descended into during decryption
/// walks.
const SKIP_DIRS: [&str; 5] =
  [".git", ".github", ".vscode", ".idea", "node_modules"];

/// Byte-level detection of SOPS-encrypted content: the metadata
/// sentinel plus at least one encrypted value.
pub fn is_sops_encrypted(contents: &[u8]) -> bool {
  contains(contents, b"sops") && contains(contents, b"ENC[")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
  haystack
    .windows(needle.len())
    .any(|window| window == needle)
}

/// Whether decryption is available at all.
pub fn sops_enabled() -> bool {
  core_config().sops_age_key.is_some()
}

/// Decrypts one file in memory via the sops CLI; plaintext never
/// touches the disk.
pub async fn decrypt_in_memory(
  path: &Path,
) -> anyhow::Result<String> {
  let (env, replacers) = sops_env()?;
  let log = run_doco_command_with_sanitization(
    "SOPS Decrypt",
    None,
    format!("{env}sops --decrypt {}", path.display()),
    &replacers,
  )
  .await;
  if !log.success {
    return Err(anyhow!("{}", log.stderr))
      .with_context(|| format!("failed to decrypt {path:?}"));
  }
  Ok(log.stdout)
}

/// Reads a file, decrypting when it carries the SOPS sentinels.
pub async fn read_maybe_encrypted(
  path: &Path,
) -> anyhow::Result<String> {
  let raw = tokio::fs::read(path)
    .await
    .with_context(|| format!("failed to read {path:?}"))?;
  if sops_enabled() && is_sops_encrypted(&raw) {
    return decrypt_in_memory(path).await;
  }
  String::from_utf8(raw)
    .with_context(|| format!("{path:?} is not valid utf-8"))
}

/// Walks the tree and decrypts every encrypted file in place, so
/// the engine can read the plaintext at apply time. Symlinks are
/// followed but must not escape the repository root.
pub async fn decrypt_directory(root: &Path) -> anyhow::Result<()> {
  if !sops_enabled() {
    return Ok(());
  }
  let canonical_root = root
    .canonicalize()
    .with_context(|| format!("failed to canonicalize {root:?}"))?;
  let walk = walkdir::WalkDir::new(root)
    .follow_links(true)
    .into_iter()
    .filter_entry(|entry| {
      !(entry.file_type().is_dir()
        && entry
          .file_name()
          .to_str()
          .is_some_and(|name| SKIP_DIRS.contains(&name)))
    });
  for entry in walk {
    let entry = entry.context("failed to walk repository")?;
    if !entry.file_type().is_file() {
      continue;
    }
    let resolved = entry.path().canonicalize().with_context(
      || format!("failed to resolve {:?}", entry.path()),
    )?;
    paths::verify_and_sanitize(&resolved, &canonical_root)
      .with_context(|| {
        format!("symlink {:?} escapes the repository", entry.path())
      })?;
    let raw = tokio::fs::read(entry.path()).await.with_context(
      || format!("failed to read {:?}", entry.path()),
    )?;
    if !is_sops_encrypted(&raw) {
      continue;
    }
    let plaintext = decrypt_in_memory(entry.path()).await?;
    tokio::fs::write(entry.path(), plaintext)
      .await
      .with_context(|| {
        format!("failed to write decrypted {:?}", entry.path())
      })?;
    debug!("decrypted {:?}", entry.path());
  }
  Ok(())
}

fn sops_env() -> anyhow::Result<(String, Vec<(String, String)>)> {
  let key = core_config()
    .sops_age_key
    .as_ref()
    .context("SOPS_AGE_KEY is not configured")?;
  Ok((
    format!("SOPS_AGE_KEY='{key}' "),
    vec![(key.clone(), String::from("<AGE_KEY>"))],
  ))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn detects_sops_sentinels() {
    let encrypted = b"DB_PASSWORD=ENC[AES256_GCM,data:...]\nsops_age__list_0__map_enc=...\n";
    assert!(is_sops_encrypted(encrypted));
    assert!(!is_sops_encrypted(b"DB_PASSWORD=plaintext\n"));
    // Either sentinel alone is not enough.
    assert!(!is_sops_encrypted(b"uses sops for encryption\n"));
    assert!(!is_sops_encrypted(b"looks like ENC[data]\n"));
  }
}
