use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Compose file names recognized when a descriptor does not name
/// its own, and during auto-discovery.
pub const DEFAULT_COMPOSE_FILES: [&str; 4] = [
  "compose.yaml",
  "compose.yml",
  "docker-compose.yaml",
  "docker-compose.yml",
];

const DISCOVER_SKIP_DIRS: [&str; 5] =
  [".git", ".github", ".vscode", ".idea", "node_modules"];

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 180;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  /// Terminal: an explicitly requested target has no descriptor.
  #[error("no deployment configuration found for target '{0}'")]
  CustomTargetNotFound(String),
}

/// One stack's desired state, from a `.doco-cd.yaml` document,
/// an inline poll entry, or defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
  #[serde(default)]
  pub name: String,
  /// Overrides the event repository when set. Must be http(s).
  #[serde(default)]
  pub repository_url: Option<String>,
  /// Regex matched against the webhook reference. Non-matching
  /// webhook jobs are skipped.
  #[serde(default)]
  pub webhook_filter: Option<String>,
  /// Inherits the event reference when empty.
  #[serde(default)]
  pub reference: String,
  /// Repo-relative directory the compose files resolve in.
  #[serde(default = "default_working_directory")]
  pub working_directory: String,
  /// Base names only, resolved inside the working directory.
  #[serde(default)]
  pub compose_files: Vec<String>,
  #[serde(default = "default_true")]
  pub remove_orphans: bool,
  #[serde(default)]
  pub force_recreate: bool,
  #[serde(default)]
  pub force_image_pull: bool,
  /// Job timeout in seconds.
  #[serde(default = "default_timeout")]
  pub timeout: u64,
  #[serde(default)]
  pub build_opts: BuildOpts,
  /// Destroy instead of deploy.
  #[serde(default)]
  pub destroy: bool,
  #[serde(default)]
  pub destroy_opts: DestroyOpts,
  /// Run the destroy path when the tracked reference is deleted
  /// at the remote.
  #[serde(default)]
  pub destroy_on_delete: bool,
  /// Activated compose profiles.
  #[serde(default)]
  pub profiles: Vec<String>,
  /// {environment variable -> external secret reference}
  #[serde(default)]
  pub secrets: IndexMap<String, String>,
  /// Emit one stack per directory holding a compose file under
  /// the working directory.
  #[serde(default)]
  pub auto_discover: bool,
  #[serde(default = "default_scan_depth")]
  pub scan_depth: usize,
  /// `<relative>`, `file:<relative>` or `remote:<relative>`.
  #[serde(default)]
  pub env_files: Vec<String>,
}

fn default_working_directory() -> String {
  String::from(".")
}

fn default_true() -> bool {
  true
}

fn default_timeout() -> u64 {
  DEFAULT_TIMEOUT_SECONDS
}

fn default_scan_depth() -> usize {
  2
}

#[derive(
  Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq,
)]
pub struct BuildOpts {
  #[serde(default)]
  pub force_pull: bool,
  #[serde(default)]
  pub quiet: bool,
  #[serde(default)]
  pub args: IndexMap<String, String>,
  #[serde(default)]
  pub no_cache: bool,
}

impl BuildOpts {
  pub fn is_none(&self) -> bool {
    self == &BuildOpts::default()
  }
}

#[derive(
  Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq,
)]
pub struct DestroyOpts {
  #[serde(default)]
  pub remove_volumes: bool,
  #[serde(default)]
  pub remove_images: bool,
  #[serde(default)]
  pub remove_dir: bool,
}

/// One entry of `env_files`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvFileEntry {
  /// Read from the working tree. A missing plain `.env` is
  /// tolerated, everything else must exist.
  Tree(String),
  /// Read from the trusted env-files directory.
  Trusted(String),
  /// Deferred to the container engine at apply time.
  Remote(String),
}

impl EnvFileEntry {
  pub fn parse(entry: &str) -> EnvFileEntry {
    if let Some(rest) = entry.strip_prefix("file:") {
      EnvFileEntry::Trusted(rest.to_string())
    } else if let Some(rest) = entry.strip_prefix("remote:") {
      EnvFileEntry::Remote(rest.to_string())
    } else {
      EnvFileEntry::Tree(entry.to_string())
    }
  }
}

pub fn default_deploy_config(
  name: &str,
  reference: &str,
) -> DeployConfig {
  DeployConfig {
    name: name.to_string(),
    repository_url: None,
    webhook_filter: None,
    reference: reference.to_string(),
    working_directory: default_working_directory(),
    compose_files: Vec::new(),
    remove_orphans: true,
    force_recreate: false,
    force_image_pull: false,
    timeout: DEFAULT_TIMEOUT_SECONDS,
    build_opts: Default::default(),
    destroy: false,
    destroy_opts: Default::default(),
    destroy_on_delete: false,
    profiles: Vec::new(),
    secrets: Default::default(),
    auto_discover: false,
    scan_depth: default_scan_depth(),
    env_files: Vec::new(),
  }
}

/// Candidate descriptor file names, most specific first.
pub fn candidate_file_names(
  custom_target: Option<&str>,
) -> Vec<String> {
  match custom_target {
    Some(target) => vec![
      format!(".doco-cd.{target}.yaml"),
      format!(".doco-cd.{target}.yml"),
    ],
    None => vec![
      String::from(".doco-cd.yaml"),
      String::from(".doco-cd.yml"),
    ],
  }
}

/// Resolves the deployment configuration for one reconciliation
/// of `repo_root` at `reference`.
///
/// Inline configurations (from a poll entry) replace file-based
/// resolution entirely. Without a descriptor file and without a
/// custom target, a single default config named after the repo
/// short name is produced; a missing custom target is terminal.
pub fn resolve_deploy_configs(
  repo_root: &Path,
  repo_name: &str,
  reference: &str,
  custom_target: Option<&str>,
  inline: &[DeployConfig],
  base_dir: &str,
) -> anyhow::Result<Vec<DeployConfig>> {
  let mut configs = if !inline.is_empty() {
    inline.to_vec()
  } else {
    let cfg_dir = paths::verify_and_sanitize(base_dir, repo_root)
      .context("deploy config base dir escapes the repository")?;
    match read_descriptor_file(&cfg_dir, custom_target)? {
      Some(contents) => parse_descriptor_documents(&contents)?,
      None => match custom_target {
        Some(target) => {
          return Err(
            ConfigError::CustomTargetNotFound(target.to_string())
              .into(),
          );
        }
        None => {
          vec![default_deploy_config(
            git::short_name(repo_name),
            reference,
          )]
        }
      },
    }
  };

  for config in &mut configs {
    validate_deploy_config(config, reference)?;
  }

  let configs = expand_auto_discover(configs, repo_root)?;
  validate_unique_names(&configs)?;

  Ok(configs)
}

fn read_descriptor_file(
  cfg_dir: &Path,
  custom_target: Option<&str>,
) -> anyhow::Result<Option<String>> {
  for candidate in candidate_file_names(custom_target) {
    let path = cfg_dir.join(&candidate);
    if !path.is_file() {
      continue;
    }
    let contents =
      std::fs::read_to_string(&path).with_context(|| {
        format!("failed to read deploy config at {path:?}")
      })?;
    return Ok(Some(contents));
  }
  Ok(None)
}

pub fn parse_descriptor_documents(
  contents: &str,
) -> anyhow::Result<Vec<DeployConfig>> {
  let mut configs = Vec::new();
  for document in serde_yaml_ng::Deserializer::from_str(contents) {
    let config = DeployConfig::deserialize(document)
      .context("invalid deploy config document")?;
    configs.push(config);
  }
  Ok(configs)
}

/// Field-level validation, applying the event reference where the
/// descriptor leaves its own empty.
pub fn validate_deploy_config(
  config: &mut DeployConfig,
  default_reference: &str,
) -> anyhow::Result<()> {
  if config.name.trim().is_empty() {
    anyhow::bail!("deploy config name must not be empty");
  }

  if config.reference.trim().is_empty() {
    config.reference = default_reference.to_string();
  }

  let working_directory = Path::new(&config.working_directory);
  if working_directory.is_absolute()
    || !paths::is_local(working_directory)
  {
    anyhow::bail!(
      "working_directory '{}' escapes the repository",
      config.working_directory
    );
  }
  config.working_directory = paths::clean(working_directory)
    .to_string_lossy()
    .into_owned();

  for file in &config.compose_files {
    if !paths::is_basename(file) {
      anyhow::bail!(
        "compose file '{file}' must be a base name without directories"
      );
    }
  }
  if config.compose_files.is_empty() {
    config.compose_files = DEFAULT_COMPOSE_FILES
      .iter()
      .map(|file| file.to_string())
      .collect();
  }

  if let Some(url) = &config.repository_url
    && !url.starts_with("http://")
    && !url.starts_with("https://")
  {
    anyhow::bail!(
      "repository_url '{url}' must be an http(s) url"
    );
  }

  if let Some(filter) = &config.webhook_filter {
    regex::Regex::new(filter).with_context(|| {
      format!("invalid webhook_filter regex '{filter}'")
    })?;
  }

  if config.timeout == 0 {
    config.timeout = DEFAULT_TIMEOUT_SECONDS;
  }

  Ok(())
}

pub fn validate_unique_names(
  configs: &[DeployConfig],
) -> anyhow::Result<()> {
  let mut seen = indexmap::IndexSet::new();
  for config in configs {
    if !seen.insert(&config.name) {
      anyhow::bail!("duplicate stack name '{}'", config.name);
    }
  }
  Ok(())
}

/// Replaces templates with one discovered config per directory
/// holding a recognized compose file, down to `scan_depth` levels
/// under the template's working directory.
fn expand_auto_discover(
  configs: Vec<DeployConfig>,
  repo_root: &Path,
) -> anyhow::Result<Vec<DeployConfig>> {
  let mut expanded = Vec::new();
  for config in configs {
    if !config.auto_discover {
      expanded.push(config);
      continue;
    }
    let scan_root =
      paths::verify_and_sanitize(&config.working_directory, repo_root)
        .context("auto discover root escapes the repository")?;
    let walk = walkdir::WalkDir::new(&scan_root)
      .min_depth(0)
      .max_depth(config.scan_depth)
      .into_iter()
      .filter_entry(|entry| {
        !(entry.file_type().is_dir()
          && entry
            .file_name()
            .to_str()
            .is_some_and(|name| DISCOVER_SKIP_DIRS.contains(&name)))
      });
    for entry in walk {
      let entry = entry.context("auto discover walk failed")?;
      if !entry.file_type().is_dir() {
        continue;
      }
      let has_compose = config.compose_files.iter().any(|file| {
        entry.path().join(file).is_file()
      });
      if !has_compose {
        continue;
      }
      let relative = entry
        .path()
        .strip_prefix(repo_root)
        .context("discovered directory outside the repository")?;
      let name = entry
        .path()
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| config.name.clone());
      let mut discovered = config.clone();
      discovered.name = name;
      discovered.working_directory = if relative.as_os_str().is_empty()
      {
        String::from(".")
      } else {
        relative.to_string_lossy().into_owned()
      };
      discovered.auto_discover = false;
      expanded.push(discovered);
    }
  }
  Ok(expanded)
}

/// Internal path of the stack's working directory, guarded
/// against traversal.
pub fn stack_working_dir(
  repo_root: &Path,
  config: &DeployConfig,
) -> anyhow::Result<PathBuf> {
  paths::verify_and_sanitize(&config.working_directory, repo_root)
    .map_err(|e| anyhow!(e))
    .context("working directory escapes the repository")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_reference_inherits_event_reference() {
    let mut config = default_deploy_config("web", "");
    validate_deploy_config(&mut config, "refs/heads/main").unwrap();
    assert_eq!(config.reference, "refs/heads/main");

    let mut config = default_deploy_config("web", "refs/tags/v1");
    validate_deploy_config(&mut config, "refs/heads/main").unwrap();
    assert_eq!(config.reference, "refs/tags/v1");
  }

  #[test]
  fn working_directory_must_stay_local() {
    for bad in ["../other", "a/../../b", "/abs"] {
      let mut config = default_deploy_config("web", "main");
      config.working_directory = bad.to_string();
      validate_deploy_config(&mut config, "main").unwrap_err();
    }
    let mut config = default_deploy_config("web", "main");
    config.working_directory = String::from("./services/app/");
    validate_deploy_config(&mut config, "main").unwrap();
    assert_eq!(config.working_directory, "services/app");
  }

  #[test]
  fn compose_files_must_be_basenames() {
    let mut config = default_deploy_config("web", "main");
    config.compose_files = vec![String::from("sub/compose.yaml")];
    validate_deploy_config(&mut config, "main").unwrap_err();

    let mut config = default_deploy_config("web", "main");
    config.compose_files = vec![String::from("../compose.yaml")];
    validate_deploy_config(&mut config, "main").unwrap_err();
  }

  #[test]
  fn empty_compose_files_fall_back_to_defaults() {
    let mut config = default_deploy_config("web", "main");
    validate_deploy_config(&mut config, "main").unwrap();
    assert_eq!(config.compose_files.len(), 4);
  }

  #[test]
  fn repository_url_must_be_http() {
    let mut config = default_deploy_config("web", "main");
    config.repository_url =
      Some(String::from("git@github.com:acme/app.git"));
    validate_deploy_config(&mut config, "main").unwrap_err();

    let mut config = default_deploy_config("web", "main");
    config.repository_url =
      Some(String::from("https://github.com/acme/app.git"));
    validate_deploy_config(&mut config, "main").unwrap();
  }

  #[test]
  fn invalid_webhook_filter_rejected() {
    let mut config = default_deploy_config("web", "main");
    config.webhook_filter = Some(String::from("refs/(heads"));
    validate_deploy_config(&mut config, "main").unwrap_err();

    let mut config = default_deploy_config("web", "main");
    config.webhook_filter =
      Some(String::from("^refs/heads/(main|release-.*)$"));
    validate_deploy_config(&mut config, "main").unwrap();
  }

  #[test]
  fn duplicate_stack_names_rejected() {
    let configs = vec![
      default_deploy_config("web", "main"),
      default_deploy_config("web", "main"),
    ];
    validate_unique_names(&configs).unwrap_err();
  }

  #[test]
  fn parses_multi_document_descriptors() {
    let contents = r#"
name: web
working_directory: services/web
---
name: worker
working_directory: services/worker
secrets:
  DB_PASSWORD: "kv:apps:worker:db_password"
"#;
    let configs = parse_descriptor_documents(contents).unwrap();
    assert_eq!(configs.len(), 2);
    assert_eq!(configs[0].name, "web");
    assert_eq!(configs[1].name, "worker");
    assert_eq!(
      configs[1].secrets.get("DB_PASSWORD").map(String::as_str),
      Some("kv:apps:worker:db_password")
    );
  }

  #[test]
  fn env_file_entry_forms() {
    assert_eq!(
      EnvFileEntry::parse(".env"),
      EnvFileEntry::Tree(String::from(".env"))
    );
    assert_eq!(
      EnvFileEntry::parse("file:shared/prod.env"),
      EnvFileEntry::Trusted(String::from("shared/prod.env"))
    );
    assert_eq!(
      EnvFileEntry::parse("remote:runtime.env"),
      EnvFileEntry::Remote(String::from("runtime.env"))
    );
  }

  #[test]
  fn custom_target_without_file_is_terminal() {
    let dir = std::env::temp_dir().join("doco-cd-test-empty-repo");
    std::fs::create_dir_all(&dir).unwrap();
    let err = resolve_deploy_configs(
      &dir,
      "github.com/acme/app",
      "main",
      Some("staging"),
      &[],
      ".",
    )
    .unwrap_err();
    assert!(
      err.downcast_ref::<ConfigError>().is_some(),
      "{err:#}"
    );
  }

  #[test]
  fn missing_file_without_target_yields_default() {
    let dir = std::env::temp_dir().join("doco-cd-test-default-repo");
    std::fs::create_dir_all(&dir).unwrap();
    let configs = resolve_deploy_configs(
      &dir,
      "github.com/acme/app",
      "refs/heads/main",
      None,
      &[],
      ".",
    )
    .unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].name, "app");
    assert_eq!(configs[0].reference, "refs/heads/main");
  }

  #[test]
  fn inline_configs_replace_file_resolution() {
    let dir = std::env::temp_dir().join("doco-cd-test-inline-repo");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
      dir.join(".doco-cd.yaml"),
      "name: from-file\n",
    )
    .unwrap();
    let inline = vec![default_deploy_config("from-poll", "main")];
    let configs = resolve_deploy_configs(
      &dir,
      "github.com/acme/app",
      "main",
      None,
      &inline,
      ".",
    )
    .unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].name, "from-poll");
  }

  #[test]
  fn auto_discover_emits_one_stack_per_compose_dir() {
    let dir =
      std::env::temp_dir().join("doco-cd-test-discover-repo");
    let _ = std::fs::remove_dir_all(&dir);
    for (sub, file) in [
      ("services/web", "compose.yaml"),
      ("services/worker", "docker-compose.yml"),
      ("services/docs", "README.md"),
    ] {
      let sub = dir.join(sub);
      std::fs::create_dir_all(&sub).unwrap();
      std::fs::write(sub.join(file), "services: {}\n").unwrap();
    }
    let mut template = default_deploy_config("template", "main");
    template.auto_discover = true;
    template.working_directory = String::from("services");
    template.scan_depth = 1;
    validate_deploy_config(&mut template, "main").unwrap();
    let configs =
      expand_auto_discover(vec![template], &dir).unwrap();
    let mut names = configs
      .iter()
      .map(|config| config.name.as_str())
      .collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, ["web", "worker"]);
    let web = configs
      .iter()
      .find(|config| config.name == "web")
      .unwrap();
    assert_eq!(web.working_directory, "services/web");
    assert!(!web.auto_discover);
  }
}
