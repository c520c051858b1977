use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
  dispatch,
  listener::ParsedPayload,
  resolve::{self, DeployConfig},
};

/// Smallest allowed polling interval in seconds. 0 disables the
/// worker.
pub const MIN_INTERVAL_SECONDS: u64 = 10;

const DEFAULT_INTERVAL_SECONDS: u64 = 300;

/// One polling job: a repository checked on an interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
  /// HTTP(S) clone url.
  pub url: String,
  /// Branch, tag, full ref or commit sha.
  pub reference: String,
  #[serde(default = "default_interval")]
  pub interval: u64,
  #[serde(default)]
  pub run_once: bool,
  #[serde(default)]
  pub custom_target: Option<String>,
  /// Inline deployment descriptors. When present they replace
  /// in-tree descriptor resolution.
  #[serde(default)]
  pub deployments: Vec<DeployConfig>,
}

fn default_interval() -> u64 {
  DEFAULT_INTERVAL_SECONDS
}

impl PollConfig {
  /// A canonical payload for downstream stages, shaped like a
  /// webhook push for this repository.
  pub fn synthesize_payload(&self) -> ParsedPayload {
    let repo_name = git::derive_repo_name(&self.url);
    ParsedPayload {
      name: git::short_name(&repo_name).to_string(),
      full_name: git::full_name(&repo_name).to_string(),
      reference: self.reference.clone(),
      ref_type: if self.reference.starts_with("refs/tags/") {
        String::from("tag")
      } else {
        String::from("branch")
      },
      clone_url: self.url.clone(),
      ..Default::default()
    }
  }

  pub fn validate(&self) -> anyhow::Result<()> {
    if self.url.trim().is_empty() {
      anyhow::bail!("poll config url must not be empty");
    }
    if !self.url.starts_with("http://")
      && !self.url.starts_with("https://")
    {
      anyhow::bail!(
        "poll config url '{}' must be http(s)",
        self.url
      );
    }
    if self.reference.trim().is_empty() {
      anyhow::bail!(
        "poll config for '{}' has an empty reference",
        self.url
      );
    }
    if self.interval != 0 && self.interval < MIN_INTERVAL_SECONDS {
      anyhow::bail!(
        "poll interval {}s for '{}' is below the {MIN_INTERVAL_SECONDS}s minimum",
        self.interval,
        self.url
      );
    }
    resolve::validate_unique_names(&self.deployments)
      .context("invalid inline deployments")?;
    Ok(())
  }

  fn enabled(&self) -> bool {
    self.interval != 0 || self.run_once
  }
}

/// Parses the poll configuration set (a YAML list).
pub fn load_poll_configs(
  raw: &str,
) -> anyhow::Result<Vec<PollConfig>> {
  let configs: Vec<PollConfig> = serde_yaml_ng::from_str(raw)
    .context("failed to parse poll config")?;
  for config in &configs {
    config.validate()?;
  }
  Ok(configs)
}

/// One worker per enabled poll config. Workers for different
/// repositories run in parallel; a worker sheds its run when the
/// repository lock is held.
pub fn spawn_poll_workers() -> anyhow::Result<()> {
  let Some(raw) = &crate::config::core_config().poll_config else {
    return Ok(());
  };
  let configs = load_poll_configs(raw)?;
  let mut started = 0;
  for config in configs {
    if !config.enabled() {
      info!(
        "poll | {} is disabled (interval 0), not starting a worker",
        config.url
      );
      continue;
    }
    started += 1;
    tokio::spawn(poll_worker(config));
  }
  if started > 0 {
    info!("📡 {started} poll worker(s) started");
  }
  Ok(())
}

async fn poll_worker(config: PollConfig) {
  // Spread workers out so simultaneous startup does not burst.
  let jitter =
    rand::rng().random_range(0..=MIN_INTERVAL_SECONDS * 100);
  tokio::time::sleep(Duration::from_millis(jitter)).await;

  loop {
    if !config.run_once {
      tokio::time::sleep(Duration::from_secs(config.interval))
        .await;
    }
    match dispatch::reconcile_poll(&config).await {
      Ok(Some(summary)) => {
        debug!(
          "poll | {} | {} stack(s), {} failed",
          summary.repository,
          summary.results.len(),
          summary.failed(),
        );
      }
      // Lock was held, run shed.
      Ok(None) => {}
      Err(e) => {
        error!("poll | {} | {e:#}", config.url);
      }
    }
    if config.run_once {
      break;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn interval_below_minimum_is_invalid() {
    let raw = "- url: https://github.com/acme/app.git\n  reference: main\n  interval: 5\n";
    load_poll_configs(raw).unwrap_err();
  }

  #[test]
  fn interval_zero_disables_the_worker() {
    let raw = "- url: https://github.com/acme/app.git\n  reference: main\n  interval: 0\n";
    let configs = load_poll_configs(raw).unwrap();
    assert!(!configs[0].enabled());

    let raw = "- url: https://github.com/acme/app.git\n  reference: main\n  interval: 0\n  run_once: true\n";
    let configs = load_poll_configs(raw).unwrap();
    assert!(configs[0].enabled());
  }

  #[test]
  fn non_http_url_rejected() {
    let raw =
      "- url: git@github.com:acme/app.git\n  reference: main\n";
    load_poll_configs(raw).unwrap_err();
  }

  #[test]
  fn duplicate_inline_stack_names_rejected() {
    let raw = r#"
- url: https://github.com/acme/app.git
  reference: main
  deployments:
    - name: web
    - name: web
"#;
    load_poll_configs(raw).unwrap_err();
  }

  #[test]
  fn synthesized_payload_is_canonical() {
    let config = PollConfig {
      url: String::from("https://github.com/acme/app.git"),
      reference: String::from("refs/heads/main"),
      interval: 60,
      run_once: false,
      custom_target: None,
      deployments: Vec::new(),
    };
    let payload = config.synthesize_payload();
    assert_eq!(payload.name, "app");
    assert_eq!(payload.full_name, "acme/app");
    assert_eq!(payload.reference, "refs/heads/main");
    assert_eq!(
      payload.clone_url,
      "https://github.com/acme/app.git"
    );
  }
}
