use anyhow::Context;

use super::Job;
use crate::{
  change,
  config::core_config,
  docker::{self, compose},
  resolve,
};

/// Applies the stack through the engine, stamping the label
/// schema read back by later change detection.
pub async fn run(job: &mut Job) -> anyhow::Result<()> {
  let latest_commit = match &job.state.latest_commit {
    Some(commit) => commit.clone(),
    None => {
      git::latest_commit(
        &job.repo.internal_path,
        &git::GitRef::parse(&job.config.reference),
      )
      .await?
    }
  };

  job.state.force_deploy = change::should_force_deploy(
    &job.config.name,
    &latest_commit,
    core_config().max_deployment_loop_count,
  );
  if job.state.force_deploy {
    warn!(
      "job {} | {} | deployment loop detected at {latest_commit}, forcing",
      job.meta.id, job.config.name,
    );
  }

  let internal_dir = resolve::stack_working_dir(
    &job.repo.internal_path,
    &job.config,
  )?;
  let external_dir = paths::verify_and_sanitize(
    &job.config.working_directory,
    &job.repo.external_path,
  )
  .context("working directory escapes the repository")?;

  let mut labels = vec![
    (
      docker::labels::MANAGER.to_string(),
      docker::MANAGER_NAME.to_string(),
    ),
    (
      docker::labels::REPOSITORY_NAME.to_string(),
      git::full_name(&job.repo.name).to_string(),
    ),
    (
      docker::labels::COMMIT_SHA.to_string(),
      latest_commit.clone(),
    ),
    (
      docker::labels::TRIGGER.to_string(),
      job.meta.trigger.to_string(),
    ),
    (
      docker::labels::APP_VERSION.to_string(),
      env!("CARGO_PKG_VERSION").to_string(),
    ),
  ];
  if !job.state.secrets_hash.is_empty() {
    labels.push((
      docker::labels::EXTERNAL_SECRETS_HASH.to_string(),
      job.state.secrets_hash.clone(),
    ));
  }

  let mut config = job.config.clone();
  if job.state.force_deploy {
    config.force_recreate = true;
  }

  let logs = compose::deploy_stack(compose::DeployArgs {
    config: &config,
    internal_dir: &internal_dir,
    external_dir: &external_dir,
    labels,
    secrets: &job.state.resolved_secrets,
  })
  .await
  .with_context(|| {
    format!("failed to deploy stack '{}'", job.config.name)
  })?;

  job.state.latest_commit = Some(latest_commit);
  for log in &logs {
    debug!(
      "job {} | {} | {} | {}",
      job.meta.id,
      job.config.name,
      log.stage,
      log.command
    );
  }
  Ok(())
}
