use anyhow::Context;

use super::{Job, SkipJob};
use crate::{change, docker::docker_client};

/// Runs change detection and fills the deployment state. No
/// firing signal means the job is a no-op.
pub async fn run(job: &mut Job) -> anyhow::Result<()> {
  let labels = docker_client()
    .service_labels(&job.config.name)
    .await
    .context("failed to read service labels")?;

  let decision = change::detect(
    &job.repo.internal_path,
    &job.config,
    &labels,
  )
  .await?;

  job.state.latest_commit = Some(decision.latest_commit.clone());
  job.state.changed_files = decision.changed_files;
  job.state.resolved_secrets = decision.resolved_secrets;
  job.state.secrets_hash = decision.secrets_hash;
  job.state.secrets_changed = decision.secrets_changed;

  if !decision.deploy {
    return Err(
      SkipJob(format!(
        "no changes for '{}' at {}",
        job.config.name,
        decision.latest_commit
      ))
      .into(),
    );
  }

  info!(
    "job {} | {} | deploying: {}",
    job.meta.id,
    job.config.name,
    decision.reason.unwrap_or("change detected"),
  );
  Ok(())
}
