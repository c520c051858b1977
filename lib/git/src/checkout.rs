use command::{
  Log, all_logs_success, run_doco_command,
  run_doco_command_with_sanitization,
};

use crate::{GitRef, RepoExecutionArgs};

/// Puts the working tree at the reference. Branch / tag
/// references check out `FETCH_HEAD`, so fetch first; pinned
/// commits hard-reset. Initializes submodules when configured.
pub async fn checkout(args: &RepoExecutionArgs) -> Vec<Log> {
  let path = args.destination.as_path();
  let mut logs = Vec::new();

  let log = match &args.reference {
    GitRef::Commit(sha) => {
      run_doco_command(
        "Set Commit",
        path,
        format!("git reset --hard {sha}"),
      )
      .await
    }
    _ => {
      run_doco_command(
        "Checkout",
        path,
        "git checkout --force --detach FETCH_HEAD",
      )
      .await
    }
  };
  logs.push(log);
  if !all_logs_success(&logs) {
    return logs;
  }

  if args.submodules {
    let (_, replacers) = args.remote_url();
    let submodules = run_doco_command_with_sanitization(
      "Submodules",
      path,
      format!(
        "{}git{} submodule update --init --recursive",
        args.env_prefix(),
        args.config_args(),
      ),
      &replacers,
    )
    .await;
    logs.push(submodules);
  }

  logs
}
