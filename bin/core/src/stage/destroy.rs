use anyhow::{Context, anyhow};

use super::{Job, SkipJob};
use crate::{
  config::core_config,
  docker::{self, compose, docker_client},
};

/// Takes the stack down and optionally removes volumes, images
/// and the cached repository directory.
pub async fn run(job: &mut Job) -> anyhow::Result<()> {
  let labels = docker_client()
    .service_labels(&job.config.name)
    .await
    .context("failed to read service labels")?;
  if labels.is_empty() {
    return Err(
      SkipJob(format!(
        "stack '{}' is not running",
        job.config.name
      ))
      .into(),
    );
  }

  let manager =
    docker::label_value(&labels, docker::labels::MANAGER);
  if manager != Some(docker::MANAGER_NAME) {
    return Err(anyhow!(
      "stack '{}' is not managed by {} (manager label: {:?})",
      job.config.name,
      docker::MANAGER_NAME,
      manager,
    ));
  }

  compose::destroy_stack(&job.config.name, job.config.destroy_opts)
    .await
    .with_context(|| {
      format!("failed to destroy stack '{}'", job.config.name)
    })?;

  if core_config().swarm_mode
    && job.config.destroy_opts.remove_volumes
  {
    let removed = docker_client()
      .remove_labeled_volumes(&job.config.name)
      .await?;
    if !removed.is_empty() {
      info!(
        "job {} | {} | removed volumes: {removed:?}",
        job.meta.id, job.config.name,
      );
    }
  }

  if job.config.destroy_opts.remove_dir {
    remove_repository_dir(job).await?;
  }

  Ok(())
}

/// Deletes the cached checkout. The owner directory goes too
/// unless it still holds sibling repositories.
async fn remove_repository_dir(job: &Job) -> anyhow::Result<()> {
  let path = &job.repo.internal_path;
  if !path.exists() {
    return Ok(());
  }
  // Serialize against concurrent repo operations on this path.
  let _lock = git::acquire_path_lock(path.clone()).await;
  tokio::fs::remove_dir_all(path).await.with_context(|| {
    format!("failed to remove repository dir {path:?}")
  })?;

  let Some(parent) = path.parent() else {
    return Ok(());
  };
  if parent == core_config().internal_repo_root() {
    return Ok(());
  }
  let mut entries = tokio::fs::read_dir(parent)
    .await
    .with_context(|| format!("failed to read {parent:?}"))?;
  if entries.next_entry().await?.is_none() {
    tokio::fs::remove_dir(parent).await.with_context(|| {
      format!("failed to remove empty owner dir {parent:?}")
    })?;
  }
  Ok(())
}
