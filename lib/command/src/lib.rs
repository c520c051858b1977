use std::path::Path;

use run_command::{CommandOutput, async_run_command};
use serde::{Deserialize, Serialize};

/// Unix timestamp in milliseconds as i64
pub fn doco_timestamp() -> i64 {
  async_timing_util::unix_timestamp_ms() as i64
}

/// The result of one command / lifecycle stage,
/// kept for job reporting and notifications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: i64,
  pub end_ts: i64,
}

impl Log {
  pub fn simple(stage: &str, msg: String) -> Log {
    let ts = doco_timestamp();
    Log {
      stage: stage.to_string(),
      stdout: msg,
      success: true,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  pub fn error(stage: &str, msg: String) -> Log {
    let ts = doco_timestamp();
    Log {
      stage: stage.to_string(),
      stderr: msg,
      success: false,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  pub fn combined(&self) -> String {
    match (self.stdout.is_empty(), self.stderr.is_empty()) {
      (true, true) => String::new(),
      (false, true) => self.stdout.clone(),
      (true, false) => self.stderr.clone(),
      (false, false) => {
        format!("stdout: {}\n\nstderr: {}", self.stdout, self.stderr)
      }
    }
  }
}

pub fn all_logs_success(logs: &[Log]) -> bool {
  logs.iter().all(|log| log.success)
}

pub async fn run_doco_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> Log {
  let command = if let Some(path) = path.into() {
    format!("cd {} && {}", path.display(), command.as_ref())
  } else {
    command.as_ref().to_string()
  };
  let start_ts = doco_timestamp();
  let output = async_run_command(&command).await;
  output_into_log(stage, command, start_ts, output)
}

/// Executes the command, and sanitizes the output to avoid
/// exposing secrets in the log.
pub async fn run_doco_command_with_sanitization(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
  replacers: &[(String, String)],
) -> Log {
  let mut log = run_doco_command(stage, path, command).await;
  log.command = svi::replace_in_string(&log.command, replacers);
  log.stdout = svi::replace_in_string(&log.stdout, replacers);
  log.stderr = svi::replace_in_string(&log.stderr, replacers);
  log
}

pub fn output_into_log(
  stage: &str,
  command: String,
  start_ts: i64,
  output: CommandOutput,
) -> Log {
  let success = output.success();
  Log {
    stage: stage.to_string(),
    stdout: output.stdout,
    stderr: output.stderr,
    command,
    success,
    start_ts,
    end_ts: doco_timestamp(),
  }
}
