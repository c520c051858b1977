use std::{path::PathBuf, time::Duration};

use command::doco_timestamp;
use tokio_util::sync::CancellationToken;

use crate::{listener::ParsedPayload, resolve::DeployConfig};

mod deploy;
mod destroy;
pub mod init;
mod pre_deploy;

/// Skip sentinel: the stage decided the job is a successful
/// no-op. Not a failure, no notification.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SkipJob(pub String);

/// The target stack exists but belongs to someone else.
#[derive(Debug, thiserror::Error)]
#[error(
  "stack '{stack}' is not managed by this deployment: expected repository '{expected}', found '{actual}'"
)]
pub struct DeploymentConflict {
  pub stack: String,
  pub expected: String,
  pub actual: String,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum StageToken {
  Init,
  PreDeploy,
  Deploy,
  Destroy,
  PostDeploy,
  Cleanup,
}

const DEPLOY_STAGES: &[StageToken] = &[
  StageToken::Init,
  StageToken::PreDeploy,
  StageToken::Deploy,
  StageToken::PostDeploy,
  StageToken::Cleanup,
];

const DESTROY_STAGES: &[StageToken] = &[
  StageToken::Init,
  StageToken::Destroy,
  StageToken::Cleanup,
];

#[derive(Debug, Clone, Copy)]
pub enum Trigger {
  Webhook,
  Poll,
}

impl std::fmt::Display for Trigger {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Trigger::Webhook => f.write_str("webhook"),
      Trigger::Poll => f.write_str("poll"),
    }
  }
}

/// Cached local checkout of the job's repository.
#[derive(Debug, Clone)]
pub struct RepositoryHandle {
  /// Derived `<host>/<owner>/<repo>`.
  pub name: String,
  pub clone_url: String,
  /// Container-visible working tree.
  pub internal_path: PathBuf,
  /// The same tree as the host sees it.
  pub external_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct JobMetadata {
  pub repository: String,
  pub stack: String,
  /// `<ref>@<short-sha>`, filled in once the tree is at the ref.
  pub revision: String,
  /// Time-ordered id, sortable across the process lifetime.
  pub id: String,
  pub trigger: Trigger,
}

/// Everything gathered while the job advances through its stages.
#[derive(Debug, Default)]
pub struct DeploymentState {
  pub latest_commit: Option<String>,
  pub changed_files: Vec<git::ChangedFile>,
  pub resolved_secrets:
    std::collections::HashMap<String, String>,
  pub secrets_hash: String,
  pub secrets_changed: bool,
  pub force_deploy: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StageRecord {
  pub stage: StageToken,
  pub start_ts: i64,
  pub end_ts: i64,
}

/// The per-job aggregate every stage works on. No globals beyond
/// the process config and clients.
pub struct Job {
  pub meta: JobMetadata,
  pub payload: ParsedPayload,
  pub config: DeployConfig,
  pub repo: RepositoryHandle,
  pub repo_args: git::RepoExecutionArgs,
  pub state: DeploymentState,
  pub stages: Vec<StageRecord>,
  pub cancel: CancellationToken,
  deadline: tokio::time::Instant,
}

impl Job {
  pub fn new(
    meta: JobMetadata,
    payload: ParsedPayload,
    config: DeployConfig,
    repo: RepositoryHandle,
    repo_args: git::RepoExecutionArgs,
    cancel: CancellationToken,
  ) -> Job {
    let deadline = tokio::time::Instant::now()
      + Duration::from_secs(config.timeout);
    Job {
      meta,
      payload,
      config,
      repo,
      repo_args,
      state: Default::default(),
      stages: Vec::new(),
      cancel,
      deadline,
    }
  }

  pub fn remaining(&self) -> Duration {
    self
      .deadline
      .saturating_duration_since(tokio::time::Instant::now())
  }
}

#[derive(Debug)]
pub enum JobOutcome {
  Completed,
  Skipped(String),
}

/// Drives the job through its stage list. A stage returning the
/// [SkipJob] sentinel ends the job as a successful no-op; any
/// other error fails it.
pub async fn run(job: &mut Job) -> anyhow::Result<JobOutcome> {
  let stages = if job.config.destroy {
    DESTROY_STAGES
  } else {
    DEPLOY_STAGES
  };
  for &stage in stages {
    let start_ts = doco_timestamp();
    let cancel = job.cancel.clone();
    let remaining = job.remaining();
    let timeout_secs = job.config.timeout;
    let result = tokio::select! {
      result = tokio::time::timeout(
        remaining,
        dispatch_stage(stage, job),
      ) => match result {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
          "stage {stage} exceeded the {timeout_secs}s job timeout"
        )),
      },
      _ = cancel.cancelled() => {
        Err(anyhow::anyhow!("job cancelled during {stage}"))
      }
    };
    job.stages.push(StageRecord {
      stage,
      start_ts,
      end_ts: doco_timestamp(),
    });
    match result {
      Ok(()) => {
        debug!(
          "job {} | {} | stage {stage} done",
          job.meta.id, job.meta.stack
        );
      }
      Err(e) => match e.downcast::<SkipJob>() {
        Ok(skip) => {
          info!(
            "job {} | {} | skipped in {stage}: {skip}",
            job.meta.id, job.meta.stack
          );
          return Ok(JobOutcome::Skipped(skip.0));
        }
        Err(e) => {
          return Err(e.context(format!("stage {stage} failed")));
        }
      },
    }
  }
  Ok(JobOutcome::Completed)
}

async fn dispatch_stage(
  stage: StageToken,
  job: &mut Job,
) -> anyhow::Result<()> {
  match stage {
    StageToken::Init => init::run(job).await,
    StageToken::PreDeploy => pre_deploy::run(job).await,
    StageToken::Deploy => deploy::run(job).await,
    StageToken::Destroy => destroy::run(job).await,
    // Timestamps only, reserved for user-defined hooks.
    StageToken::PostDeploy | StageToken::Cleanup => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stage_names_are_kebab_case() {
    assert_eq!(StageToken::Init.to_string(), "init");
    assert_eq!(StageToken::PreDeploy.to_string(), "pre-deploy");
    assert_eq!(StageToken::PostDeploy.to_string(), "post-deploy");
  }

  #[test]
  fn deploy_and_destroy_paths() {
    assert_eq!(DEPLOY_STAGES.len(), 5);
    assert_eq!(DESTROY_STAGES.len(), 3);
    assert!(DESTROY_STAGES.contains(&StageToken::Destroy));
    assert!(!DEPLOY_STAGES.contains(&StageToken::Destroy));
  }

  #[test]
  fn skip_sentinel_survives_anyhow_roundtrip() {
    let e: anyhow::Error =
      SkipJob(String::from("nothing changed")).into();
    let skip = e.downcast::<SkipJob>().unwrap();
    assert_eq!(skip.0, "nothing changed");
  }
}
