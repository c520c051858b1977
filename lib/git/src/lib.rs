use std::{path::PathBuf, sync::OnceLock};

use anyhow::Context;
use cache::KeyedLock;
use command::{Log, run_doco_command};
use tokio::sync::OwnedMutexGuard;

mod args;
mod checkout;
mod clone;
mod ensure;
mod query;
mod ssh;
mod update;

pub use args::*;
pub use checkout::checkout;
pub use clone::clone;
pub use ensure::ensure_repository;
pub use query::*;
pub use ssh::{SshMaterial, ensure_known_host, init_ssh_material};
pub use update::update;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
  /// Recoverable: the caller falls back to [update].
  #[error("repository already exists at {0:?}")]
  RepositoryAlreadyExists(PathBuf),
  /// Terminal for the job.
  #[error("invalid reference '{0}'")]
  InvalidReference(String),
  #[error("ssh URL requires SSH private key")]
  SshKeyMissing,
}

/// The result of a mutating repository operation.
#[derive(Debug, Clone, Default)]
pub struct GitRes {
  pub path: PathBuf,
  pub logs: Vec<Log>,
  /// Latest commit sha (full), if it could be read.
  pub hash: Option<String>,
  /// Latest commit message, if it could be read.
  pub message: Option<String>,
}

fn repo_locks() -> &'static KeyedLock<PathBuf> {
  static REPO_LOCKS: OnceLock<KeyedLock<PathBuf>> = OnceLock::new();
  REPO_LOCKS.get_or_init(Default::default)
}

/// Serializes mutating operations on one on-disk path.
/// The guard releases on drop; different paths proceed in parallel.
pub async fn acquire_path_lock(
  path: PathBuf,
) -> OwnedMutexGuard<()> {
  repo_locks().acquire(path).await
}

/// Reads the repo's latest commit hash and message into a Log.
/// Returns (log, hash, message).
pub async fn get_commit_hash_log(
  repo_dir: &std::path::Path,
) -> anyhow::Result<(Log, String, String)> {
  let log = run_doco_command(
    "Latest Commit",
    repo_dir,
    "git log -1 --pretty=format:%H%n%s",
  )
  .await;
  if !log.success {
    return Err(anyhow::anyhow!("{}", log.stderr))
      .context("failed to read latest commit");
  }
  let (hash, message) = log
    .stdout
    .split_once('\n')
    .map(|(hash, message)| {
      (hash.trim().to_string(), message.trim().to_string())
    })
    .unwrap_or((log.stdout.trim().to_string(), String::new()));
  if hash.len() != 40 {
    return Err(anyhow::anyhow!(
      "unexpected rev output '{hash}'"
    ));
  }
  Ok((log, hash, message))
}
