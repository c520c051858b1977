use anyhow::Context;

use super::{DeploymentConflict, Job, SkipJob, Trigger};
use crate::{
  config::core_config,
  docker::{self, docker_client},
};

/// Brings the repository to the job's reference (deploy path) or
/// verifies ownership of the running stack (destroy path).
pub async fn run(job: &mut Job) -> anyhow::Result<()> {
  let config = core_config();

  if matches!(job.meta.trigger, Trigger::Webhook)
    && let Some(filter) = &job.config.webhook_filter
  {
    let filter = regex::Regex::new(filter)
      .context("invalid webhook_filter regex")?;
    if !filter.is_match(&job.payload.reference) {
      return Err(
        SkipJob(format!(
          "reference '{}' does not match webhook filter",
          job.payload.reference
        ))
        .into(),
      );
    }
  }

  // A descriptor-level repository override replaces the event's
  // repository entirely.
  if let Some(url) = &job.config.repository_url
    && url != &job.repo.clone_url
  {
    let name = git::derive_repo_name(url);
    job.repo = super::RepositoryHandle {
      internal_path: config.internal_repo_root().join(&name),
      external_path: config.external_repo_root().join(&name),
      clone_url: url.clone(),
      name,
    };
    job.repo_args = build_repo_args(&job.repo, &job.config.reference)?;
  }

  // Both sides of the mount must resolve under their roots.
  job.repo.internal_path = paths::verify_and_sanitize(
    &job.repo.internal_path,
    config.internal_repo_root(),
  )
  .context("repository path escapes the data mount")?;
  job.repo.external_path = paths::verify_and_sanitize(
    &job.repo.external_path,
    config.external_repo_root(),
  )
  .context("repository path escapes the data mount")?;

  if job.config.destroy {
    return verify_destroy_target(job).await;
  }

  // HEAD already at the remote tip means the tree can be opened
  // in place, skipping clone / update entirely.
  let matches = git::matches_head(&job.repo_args)
    .await
    .unwrap_or_default();
  if !matches {
    let (res, fresh) =
      git::ensure_repository(&job.repo_args).await?;
    if !command::all_logs_success(&res.logs) {
      let detail = res
        .logs
        .iter()
        .filter(|log| !log.success)
        .map(command::Log::combined)
        .collect::<Vec<_>>()
        .join("\n");
      anyhow::bail!(
        "failed to fetch {} at {}: {detail}",
        job.repo.name,
        job.config.reference
      );
    }
    debug!(
      "job {} | repo {} {}",
      job.meta.id,
      job.repo.name,
      if fresh { "cloned" } else { "updated" }
    );
  }

  let short = git::short_unique_sha(
    &job.repo.internal_path,
    "HEAD",
    7,
  )
  .await;
  job.meta.revision = format!("{}@{short}", job.config.reference);

  Ok(())
}

/// Destroy path: the running services must be labeled as managed
/// by this system for this repository.
async fn verify_destroy_target(job: &Job) -> anyhow::Result<()> {
  let labels = docker_client()
    .service_labels(&job.config.name)
    .await
    .context("failed to read service labels")?;
  if labels.is_empty() {
    return Ok(());
  }
  let repository =
    docker::label_value(&labels, docker::labels::REPOSITORY_NAME)
      .unwrap_or_default();
  let expected = git::full_name(&job.repo.name);
  if repository != expected {
    return Err(
      DeploymentConflict {
        stack: job.config.name.clone(),
        expected: expected.to_string(),
        actual: repository.to_string(),
      }
      .into(),
    );
  }
  Ok(())
}

/// Repo args from a handle, with auth selected per the config.
pub fn build_repo_args(
  repo: &super::RepositoryHandle,
  reference: &str,
) -> anyhow::Result<git::RepoExecutionArgs> {
  let config = core_config();
  let mut args = git::RepoExecutionArgs::new(
    &repo.clone_url,
    reference,
    repo.internal_path.clone(),
  );
  args.auth = git::get_auth(
    &repo.clone_url,
    config.ssh.as_ref(),
    config.git_access_token.as_deref(),
    &config.auth_type,
  )?;
  args.skip_tls_verify = config.skip_tls_verification;
  args.proxy = config.http_proxy.clone();
  args.submodules = config.clone_submodules;
  Ok(args)
}
