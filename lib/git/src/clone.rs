use anyhow::Context;
use command::{
  all_logs_success, run_doco_command,
  run_doco_command_with_sanitization,
};

use crate::{
  GitAuth, GitError, GitRes, RepoExecutionArgs, acquire_path_lock,
  get_commit_hash_log, ssh::ensure_known_host,
};

/// Clones the repository to `args.destination` and leaves the
/// working tree at `args.reference`. Branch / tag references get a
/// shallow single-branch clone; a pinned commit needs full history.
///
/// An existing repository at the destination is
/// [GitError::RepositoryAlreadyExists]: recoverable, the caller
/// falls back to [crate::update].
#[tracing::instrument(level = "debug", skip(args), fields(repo = %args.name))]
pub async fn clone(args: &RepoExecutionArgs) -> anyhow::Result<GitRes> {
  let _lock = acquire_path_lock(args.destination.clone()).await;

  if args.destination.join(".git").exists() {
    return Err(
      GitError::RepositoryAlreadyExists(args.destination.clone())
        .into(),
    );
  }

  if let (GitAuth::Ssh(material), Some(host)) =
    (&args.auth, args.host())
  {
    ensure_known_host(&host, &material.known_hosts_path).await?;
  }

  if let Some(parent) = args.destination.parent() {
    tokio::fs::create_dir_all(parent).await.with_context(|| {
      format!("failed to create repository parent {parent:?}")
    })?;
  }

  let (url, replacers) = args.remote_url();
  let depth = if args.reference.is_commit() {
    String::new()
  } else {
    format!(
      " --depth 1 --single-branch --branch {}",
      args.reference.short_name()
    )
  };
  let submodules = if args.submodules {
    " --recurse-submodules"
  } else {
    ""
  };

  let mut logs = Vec::new();
  let clone_log = run_doco_command_with_sanitization(
    "Clone Repo",
    None,
    format!(
      "{}git{} clone {url} {}{depth}{submodules}",
      args.env_prefix(),
      args.config_args(),
      args.destination.display(),
    ),
    &replacers,
  )
  .await;
  let success = clone_log.success;
  logs.push(clone_log);
  if !success {
    tracing::warn!(
      "failed to clone {} to {:?}",
      args.name,
      args.destination
    );
    return Ok(GitRes {
      path: args.destination.clone(),
      logs,
      hash: None,
      message: None,
    });
  }

  if let crate::GitRef::Commit(sha) = &args.reference {
    let reset_log = run_doco_command(
      "Set Commit",
      args.destination.as_path(),
      format!("git reset --hard {sha}"),
    )
    .await;
    logs.push(reset_log);
    if !all_logs_success(&logs) {
      return Ok(GitRes {
        path: args.destination.clone(),
        logs,
        hash: None,
        message: None,
      });
    }
  }

  tracing::debug!("repo {} cloned to {:?}", args.name, args.destination);

  let (hash, message) =
    match get_commit_hash_log(&args.destination).await {
      Ok((log, hash, message)) => {
        logs.push(log);
        (Some(hash), Some(message))
      }
      Err(e) => {
        logs.push(command::Log::error(
          "Latest Commit",
          format!("{:#}", e.context("failed to get latest commit")),
        ));
        (None, None)
      }
    };

  Ok(GitRes {
    path: args.destination.clone(),
    logs,
    hash,
    message,
  })
}
