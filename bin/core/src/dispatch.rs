use std::time::Instant;

use anyhow::Context;
use bson::oid::ObjectId;

use crate::{
  alert::{self, AlertLevel, Notification},
  config::core_config,
  listener::ParsedPayload,
  metrics::metrics,
  poll::PollConfig,
  resolve,
  stage::{
    self, Job, JobMetadata, JobOutcome, RepositoryHandle, Trigger,
  },
  state,
};

/// Outcome of one stack within a reconciliation run.
#[derive(Debug)]
pub struct StackResult {
  pub stack: String,
  pub outcome: anyhow::Result<JobOutcome>,
}

/// Aggregate of one reconciliation run. The run "completed with
/// errors" when any stack failed; the others still went through.
#[derive(Debug)]
pub struct RunSummary {
  pub repository: String,
  pub results: Vec<StackResult>,
}

impl RunSummary {
  pub fn failed(&self) -> usize {
    self
      .results
      .iter()
      .filter(|result| result.outcome.is_err())
      .count()
  }
}

/// Webhook entry point. Blocks on the per-repository lock, so an
/// event for a busy repository waits (bounded by the job
/// timeout).
pub async fn reconcile_webhook(
  payload: ParsedPayload,
  ref_deleted: bool,
) -> anyhow::Result<RunSummary> {
  let repo_name = git::derive_repo_name(&payload.clone_url);
  let full_name = git::full_name(&repo_name).to_string();
  metrics()
    .webhook_requests_total
    .with_label_values(&[&full_name])
    .inc();
  let timer = Instant::now();

  let _guard = state::repo_locks().acquire(repo_name.clone()).await;
  let res = reconcile_inner(
    payload,
    Trigger::Webhook,
    None,
    &[],
    ref_deleted,
  )
  .await;

  metrics()
    .webhook_duration
    .observe(timer.elapsed().as_secs_f64());
  finish_run(&full_name, res, Trigger::Webhook)
}

/// Poll entry point. Sheds the run when the repository is busy
/// instead of queueing behind it.
pub async fn reconcile_poll(
  config: &PollConfig,
) -> anyhow::Result<Option<RunSummary>> {
  let payload = config.synthesize_payload();
  let repo_name = git::derive_repo_name(&payload.clone_url);
  let full_name = git::full_name(&repo_name).to_string();

  let Some(_guard) =
    state::repo_locks().try_acquire(repo_name.clone()).await
  else {
    info!(
      "poll | {repo_name} is busy, skipping this run"
    );
    return Ok(None);
  };

  metrics()
    .polls_total
    .with_label_values(&[&full_name])
    .inc();
  let timer = Instant::now();

  let res = reconcile_inner(
    payload,
    Trigger::Poll,
    config.custom_target.as_deref(),
    &config.deployments,
    false,
  )
  .await;

  metrics()
    .poll_duration
    .observe(timer.elapsed().as_secs_f64());
  finish_run(&full_name, res, Trigger::Poll).map(Some)
}

fn finish_run(
  full_name: &str,
  res: anyhow::Result<RunSummary>,
  trigger: Trigger,
) -> anyhow::Result<RunSummary> {
  let errors = match trigger {
    Trigger::Webhook => &metrics().webhook_errors_total,
    Trigger::Poll => &metrics().poll_errors_total,
  };
  match &res {
    Ok(summary) if summary.failed() > 0 => {
      errors.with_label_values(&[full_name]).inc();
    }
    Err(_) => {
      errors.with_label_values(&[full_name]).inc();
    }
    Ok(_) => {}
  }
  res
}

/// The shared pipeline: fetch the tree, resolve the deployment
/// configuration, run each stack through its stages in order.
async fn reconcile_inner(
  payload: ParsedPayload,
  trigger: Trigger,
  custom_target: Option<&str>,
  inline: &[resolve::DeployConfig],
  ref_deleted: bool,
) -> anyhow::Result<RunSummary> {
  let config = core_config();
  let repo_name = git::derive_repo_name(&payload.clone_url);
  let full_name = git::full_name(&repo_name).to_string();

  let internal_path = paths::verify_and_sanitize(
    &repo_name,
    config.internal_repo_root(),
  )
  .context("repository name escapes the data mount")?;
  let external_path = paths::verify_and_sanitize(
    &repo_name,
    config.external_repo_root(),
  )
  .context("repository name escapes the data mount")?;
  let repo = RepositoryHandle {
    name: repo_name.clone(),
    clone_url: payload.clone_url.clone(),
    internal_path,
    external_path,
  };

  let repo_args =
    stage::init::build_repo_args(&repo, &payload.reference)?;

  if ref_deleted {
    if !repo.internal_path.join(".git").exists() {
      info!(
        "deletion event for {repo_name} without cached checkout, ignoring"
      );
      return Ok(RunSummary {
        repository: full_name,
        results: Vec::new(),
      });
    }
  } else {
    // Initial fetch; the per-stack init stage re-checks and
    // handles per-stack reference overrides.
    let matches = git::matches_head(&repo_args)
      .await
      .unwrap_or_default();
    if !matches {
      let (res, _) = git::ensure_repository(&repo_args)
        .await
        .context("failed to fetch repository")?;
      if !command::all_logs_success(&res.logs) {
        let detail = res
          .logs
          .iter()
          .filter(|log| !log.success)
          .map(command::Log::combined)
          .collect::<Vec<_>>()
          .join("\n");
        anyhow::bail!(
          "failed to fetch {repo_name} at {}: {detail}",
          payload.reference
        );
      }
    }
  }

  let mut configs = resolve::resolve_deploy_configs(
    &repo.internal_path,
    &repo_name,
    &payload.reference,
    custom_target,
    inline,
    &config.deploy_config_base_dir,
  )
  .context("failed to resolve deployment configuration")?;

  let mut results = Vec::new();
  for deploy_config in configs.drain(..) {
    let stack = deploy_config.name.clone();

    let mut deploy_config = deploy_config;
    if ref_deleted {
      if !deploy_config.destroy_on_delete {
        results.push(StackResult {
          stack,
          outcome: Ok(JobOutcome::Skipped(String::from(
            "reference deleted",
          ))),
        });
        continue;
      }
      deploy_config.destroy = true;
    }

    let outcome =
      run_stack(&payload, trigger, &repo, deploy_config).await;
    results.push(StackResult { stack, outcome });
  }

  Ok(RunSummary {
    repository: full_name,
    results,
  })
}

async fn run_stack(
  payload: &ParsedPayload,
  trigger: Trigger,
  repo: &RepositoryHandle,
  deploy_config: resolve::DeployConfig,
) -> anyhow::Result<JobOutcome> {
  let repo_args =
    stage::init::build_repo_args(repo, &deploy_config.reference)?;
  let meta = JobMetadata {
    repository: repo.name.clone(),
    stack: deploy_config.name.clone(),
    revision: deploy_config.reference.clone(),
    id: ObjectId::new().to_hex(),
    trigger,
  };
  let mut job = Job::new(
    meta,
    payload.clone(),
    deploy_config,
    repo.clone(),
    repo_args,
    state::shutdown_token().child_token(),
  );

  info!(
    "job {} | {} | {} | {} | starting",
    job.meta.id, job.meta.repository, job.meta.stack, trigger,
  );
  let timer = Instant::now();
  let outcome = stage::run(&mut job).await;
  metrics()
    .deployment_duration
    .observe(timer.elapsed().as_secs_f64());

  let full_name = git::full_name(&job.meta.repository);
  match &outcome {
    Ok(JobOutcome::Completed) => {
      metrics()
        .deployments_total
        .with_label_values(&[full_name])
        .inc();
      info!(
        "job {} | {} | {} | done in {:?}",
        job.meta.id,
        job.meta.stack,
        job.meta.revision,
        timer.elapsed(),
      );
      alert::notify(Notification {
        level: AlertLevel::Ok,
        title: if job.config.destroy {
          String::from("Stack destroyed")
        } else {
          String::from("Stack deployed")
        },
        repository: full_name.to_string(),
        stack: job.meta.stack.clone(),
        revision: job.meta.revision.clone(),
        job_id: job.meta.id.clone(),
        message: None,
      });
    }
    Ok(JobOutcome::Skipped(reason)) => {
      debug!(
        "job {} | {} | skipped: {reason}",
        job.meta.id, job.meta.stack,
      );
    }
    Err(e) => {
      metrics()
        .deployment_errors_total
        .with_label_values(&[full_name])
        .inc();
      error!(
        "job {} | {} | {} | failed: {e:#}",
        job.meta.id, job.meta.stack, job.meta.revision,
      );
      alert::notify(Notification {
        level: AlertLevel::Error,
        title: String::from("Deployment failed"),
        repository: full_name.to_string(),
        stack: job.meta.stack.clone(),
        revision: job.meta.revision.clone(),
        job_id: job.meta.id.clone(),
        message: Some(format!("{e:#}")),
      });
    }
  }

  outcome
}
