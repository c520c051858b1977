use std::{
  collections::HashMap,
  path::Path,
  sync::{Mutex, OnceLock},
};

use anyhow::Context;
use git::{ChangedFile, GitRef, has_changes_in_subdir};

use crate::{
  docker::{self, docker_client},
  resolve::DeployConfig,
  state::secret_provider,
};

/// The pre-deploy decision and everything gathered making it.
#[derive(Debug, Default)]
pub struct ChangeDecision {
  pub deploy: bool,
  /// First signal that fired, for logging.
  pub reason: Option<&'static str>,
  pub latest_commit: String,
  pub deployed_commit: Option<String>,
  pub changed_files: Vec<ChangedFile>,
  pub resolved_secrets: HashMap<String, String>,
  pub secrets_hash: String,
  pub secrets_changed: bool,
}

/// Decides whether the stack needs a deployment: OR of commit
/// movement (filtered to the stack's working directory when the
/// diff is computable), external secret rotation, and pulled
/// image changes. All negative means the job is a no-op.
pub async fn detect(
  repo_dir: &Path,
  config: &DeployConfig,
  project_labels: &[HashMap<String, String>],
) -> anyhow::Result<ChangeDecision> {
  let mut decision = ChangeDecision::default();

  let reference = GitRef::parse(&config.reference);
  decision.latest_commit =
    git::latest_commit(repo_dir, &reference)
      .await
      .context("failed to resolve latest commit")?;

  decision.deployed_commit =
    docker::label_value(project_labels, docker::labels::COMMIT_SHA)
      .map(str::to_string);

  match &decision.deployed_commit {
    // Nothing deployed yet: treat as commit movement.
    None => {
      decision.deploy = true;
      decision.reason = Some("no deployed commit");
    }
    Some(deployed) if deployed != &decision.latest_commit => {
      match git::changed_files_between(
        repo_dir,
        deployed,
        &decision.latest_commit,
      )
      .await
      {
        Ok(files) => {
          decision.changed_files = files;
          if has_changes_in_subdir(
            &decision.changed_files,
            Path::new(&config.working_directory),
          ) {
            decision.deploy = true;
            decision.reason = Some("files changed in working directory");
          }
        }
        // The deployed commit may be gone from a shallow
        // history. Assume the worst.
        Err(e) => {
          debug!(
            "diff {deployed}..{} unavailable | {e:#}",
            decision.latest_commit
          );
          decision.deploy = true;
          decision.reason = Some("commit moved, diff unavailable");
        }
      }
    }
    Some(_) => {}
  }

  resolve_external_secrets(config, project_labels, &mut decision)
    .await?;

  if !decision.deploy && config.force_image_pull {
    detect_image_changes(repo_dir, config, &mut decision).await?;
  }

  Ok(decision)
}

/// Signal 2: resolve external references and compare the content
/// hash with the one stamped on the running stack. An empty stamp
/// counts as unchanged, fresh deploys are covered by signal 1.
async fn resolve_external_secrets(
  config: &DeployConfig,
  project_labels: &[HashMap<String, String>],
  decision: &mut ChangeDecision,
) -> anyhow::Result<()> {
  if config.secrets.is_empty() {
    return Ok(());
  }
  let provider = secret_provider().context(
    "deploy config references external secrets but no SECRET_PROVIDER is configured",
  )?;
  let resolved =
    provider.resolve_references(&config.secrets).await?;
  for (env, reference) in &config.secrets {
    if !resolved.contains_key(env) {
      anyhow::bail!(
        "secret reference '{reference}' for {env} was not resolved"
      );
    }
  }
  decision.secrets_hash = crate::secret::secrets_hash(&resolved);
  decision.resolved_secrets = resolved;

  let stamped = docker::label_value(
    project_labels,
    docker::labels::EXTERNAL_SECRETS_HASH,
  )
  .unwrap_or_default();
  if !stamped.is_empty() && stamped != decision.secrets_hash {
    decision.secrets_changed = true;
    decision.deploy = true;
    decision.reason.get_or_insert("external secrets changed");
  }
  Ok(())
}

/// Signal 3: pull and compare image id sets.
async fn detect_image_changes(
  repo_dir: &Path,
  config: &DeployConfig,
  decision: &mut ChangeDecision,
) -> anyhow::Result<()> {
  let before = docker_client().image_ids(&config.name).await?;
  let working_dir =
    crate::resolve::stack_working_dir(repo_dir, config)?;
  let pull_log = crate::docker::compose::pull(
    &config.name,
    &working_dir,
    &config.compose_files,
  )
  .await;
  if !pull_log.success {
    anyhow::bail!(
      "failed to pull images for {}: {}",
      config.name,
      pull_log.combined()
    );
  }
  let after = docker_client().image_ids(&config.name).await?;
  if before != after {
    decision.deploy = true;
    decision.reason.get_or_insert("pulled images changed");
  }
  Ok(())
}

type LoopCounters = Mutex<HashMap<String, (String, u32)>>;

fn loop_counters() -> &'static LoopCounters {
  static LOOP_COUNTERS: OnceLock<LoopCounters> = OnceLock::new();
  LOOP_COUNTERS.get_or_init(Default::default)
}

/// Tracks consecutive attempts at the same target commit per
/// stack. Hitting `max` forces the next deployment through and
/// resets; a new commit also resets.
pub fn should_force_deploy(
  stack: &str,
  commit: &str,
  max: u32,
) -> bool {
  let mut counters = loop_counters().lock().unwrap();
  let entry = counters
    .entry(stack.to_string())
    .or_insert_with(|| (commit.to_string(), 0));
  if entry.0 != commit {
    *entry = (commit.to_string(), 0);
  }
  if entry.1 >= max {
    entry.1 = 0;
    true
  } else {
    entry.1 += 1;
    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn loop_tracker_forces_after_max_attempts() {
    let stack = "loop-test-stack";
    // Three consecutive attempts at the same commit are counted,
    // the fourth forces and resets.
    assert!(!should_force_deploy(stack, "aaa", 3));
    assert!(!should_force_deploy(stack, "aaa", 3));
    assert!(!should_force_deploy(stack, "aaa", 3));
    assert!(should_force_deploy(stack, "aaa", 3));
    assert!(!should_force_deploy(stack, "aaa", 3));
  }

  #[test]
  fn loop_tracker_resets_on_new_commit() {
    let stack = "loop-reset-stack";
    assert!(!should_force_deploy(stack, "aaa", 3));
    assert!(!should_force_deploy(stack, "aaa", 3));
    assert!(!should_force_deploy(stack, "bbb", 3));
    assert!(!should_force_deploy(stack, "bbb", 3));
    assert!(!should_force_deploy(stack, "bbb", 3));
    assert!(should_force_deploy(stack, "bbb", 3));
  }
}
