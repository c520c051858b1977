use std::{path::PathBuf, sync::OnceLock};

use anyhow::anyhow;
use cache::TimeoutCache;
use command::{
  all_logs_success, doco_timestamp,
  run_doco_command_with_sanitization,
};

use crate::{
  GitAuth, GitRef, GitRes, RepoExecutionArgs, acquire_path_lock,
  checkout::checkout, get_commit_hash_log,
  ssh::ensure_known_host,
};

/// Wait this long after an update to let an identical request
/// reuse the result instead of hitting the remote again.
const UPDATE_TIMEOUT: i64 = 5_000;

fn update_cache() -> &'static TimeoutCache<PathBuf, GitRes> {
  static UPDATE_CACHE: OnceLock<TimeoutCache<PathBuf, GitRes>> =
    OnceLock::new();
  UPDATE_CACHE.get_or_init(Default::default)
}

/// Brings an existing working tree to the latest state of
/// `args.reference`. Handles remotes that moved, references that
/// changed kind, and pinned commits. The repository must already
/// be cloned.
#[tracing::instrument(level = "debug", skip(args), fields(repo = %args.name))]
pub async fn update(
  args: &RepoExecutionArgs,
) -> anyhow::Result<GitRes> {
  let _path_lock =
    acquire_path_lock(args.destination.clone()).await;

  let lock =
    update_cache().get_lock(args.destination.clone()).await;
  let mut locked = lock.lock().await;
  if locked.last_ts + UPDATE_TIMEOUT > doco_timestamp() {
    return locked.clone_res();
  }

  let res = update_inner(args).await;
  locked.set(&res, doco_timestamp());
  res
}

async fn update_inner(
  args: &RepoExecutionArgs,
) -> anyhow::Result<GitRes> {
  let path = args.destination.as_path();
  if !path.join(".git").exists() {
    return Err(anyhow!(
      "no repository at {path:?}, clone it before updating"
    ));
  }

  if let (GitAuth::Ssh(material), Some(host)) =
    (&args.auth, args.host())
  {
    ensure_known_host(&host, &material.known_hosts_path).await?;
  }

  let (url, replacers) = args.remote_url();
  let mut logs = Vec::new();

  let set_remote = run_doco_command_with_sanitization(
    "Set Remote",
    path,
    format!("git remote set-url origin {url}"),
    &replacers,
  )
  .await;
  logs.push(set_remote);
  if !all_logs_success(&logs) {
    return Ok(partial(args, logs));
  }

  let env = args.env_prefix();
  let cfg = args.config_args();
  let fetch_target = match &args.reference {
    // Pinned commits need full history to resolve.
    GitRef::Commit(_) => String::from("--tags"),
    reference => reference.short_name().to_string(),
  };
  let fetch = run_doco_command_with_sanitization(
    "Git Fetch",
    path,
    format!("{env}git{cfg} fetch --force origin {fetch_target}"),
    &replacers,
  )
  .await;
  logs.push(fetch);
  if !all_logs_success(&logs) {
    return Ok(partial(args, logs));
  }

  logs.extend(checkout(args).await);
  if !all_logs_success(&logs) {
    return Ok(partial(args, logs));
  }

  let (hash, message) = match get_commit_hash_log(path).await {
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

fn partial(args: &RepoExecutionArgs, logs: Vec<command::Log>) -> GitRes {
  GitRes {
    path: args.destination.clone(),
    logs,
    hash: None,
    message: None,
  }
}
