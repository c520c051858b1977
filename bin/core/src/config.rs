use std::{path::PathBuf, sync::OnceLock};

use anyhow::Context;
use colored::Colorize;
use environment_file::maybe_read_item_from_file;
use logger::{LogConfig, LogLevel, StdioLogMode};
use serde::Deserialize;

/// Raw environment, parsed by envy. Secrets come either directly
/// or through their `*_FILE` companion, never both.
#[derive(Deserialize)]
pub struct Env {
  pub http_port: Option<u16>,
  pub log_level: Option<LogLevel>,
  pub log_stdio: Option<StdioLogMode>,
  pub log_pretty: Option<bool>,

  pub webhook_secret: Option<String>,
  pub webhook_secret_file: Option<PathBuf>,
  pub git_access_token: Option<String>,
  pub git_access_token_file: Option<PathBuf>,
  pub auth_type: Option<String>,
  pub skip_tls_verification: Option<bool>,
  pub http_proxy: Option<String>,
  pub ssh_private_key: Option<String>,
  pub ssh_private_key_file: Option<PathBuf>,
  pub ssh_private_key_passphrase: Option<String>,
  pub ssh_private_key_passphrase_file: Option<PathBuf>,
  pub api_secret: Option<String>,
  pub api_secret_file: Option<PathBuf>,

  pub secret_provider: Option<String>,
  pub secret_provider_address: Option<String>,
  pub secret_provider_token: Option<String>,
  pub secret_provider_token_file: Option<PathBuf>,
  pub secret_provider_namespace: Option<String>,
  pub secret_provider_url: Option<String>,
  pub secret_provider_method: Option<String>,
  pub secret_provider_body: Option<String>,
  pub secret_provider_value_pointer: Option<String>,

  pub sops_age_key: Option<String>,
  pub sops_age_key_file: Option<PathBuf>,

  pub notification_url: Option<String>,
  pub notification_url_file: Option<PathBuf>,
  pub notification_provider: Option<String>,

  pub max_deployment_loop_count: Option<u32>,
  pub data_mount_point_source: Option<PathBuf>,
  pub data_mount_point_destination: Option<PathBuf>,
  pub deploy_config_base_dir: Option<String>,
  pub env_files_dir: Option<PathBuf>,
  pub poll_config: Option<String>,
  pub poll_config_file: Option<PathBuf>,
  pub docker_swarm_features: Option<bool>,
  pub git_clone_submodules: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct SecretProviderConfig {
  /// Empty when external secret resolution is disabled.
  pub provider: String,
  pub address: String,
  pub token: Option<String>,
  pub token_file: Option<PathBuf>,
  pub namespace: Option<String>,
  /// Webhook provider: templated request url.
  pub url: String,
  pub method: String,
  pub body: Option<String>,
  pub value_pointer: String,
}

/// Process-wide immutable configuration, built once at startup.
/// Invalid or missing values abort the process.
pub struct CoreConfig {
  pub http_port: u16,
  pub logging: LogConfig,
  pub webhook_secret: String,
  pub git_access_token: Option<String>,
  pub auth_type: String,
  pub skip_tls_verification: bool,
  pub http_proxy: Option<String>,
  pub ssh: Option<git::SshMaterial>,
  pub api_secret: Option<String>,
  pub secret_provider: SecretProviderConfig,
  pub sops_age_key: Option<String>,
  pub notification_url: Option<String>,
  /// `webhook` (JSON POST, default), `ntfy` or `pushover`.
  pub notification_provider: String,
  pub max_deployment_loop_count: u32,
  pub data_mount_source: PathBuf,
  pub data_mount_destination: PathBuf,
  pub deploy_config_base_dir: String,
  /// Trusted directory for `file:` env-file entries.
  pub env_files_dir: Option<PathBuf>,
  /// Raw poll configuration YAML. Parsed by the poller.
  pub poll_config: Option<String>,
  pub swarm_mode: bool,
  pub clone_submodules: bool,
}

pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| match load_config() {
    Ok(config) => config,
    Err(e) => {
      println!("{}: {e:#}", "ERROR".red());
      std::process::exit(1)
    }
  })
}

fn load_config() -> anyhow::Result<CoreConfig> {
  let env: Env = envy::from_env()
    .context("failed to parse doco-cd environment")?;

  let webhook_secret = maybe_read_item_from_file(
    "WEBHOOK_SECRET",
    env.webhook_secret_file,
    env.webhook_secret,
  )?
  .context("WEBHOOK_SECRET (or WEBHOOK_SECRET_FILE) is required")?;

  let git_access_token = maybe_read_item_from_file(
    "GIT_ACCESS_TOKEN",
    env.git_access_token_file,
    env.git_access_token,
  )?
  .filter(|token| !token.is_empty());

  let data_mount_destination = env
    .data_mount_point_destination
    .unwrap_or_else(|| PathBuf::from("/data"));
  let data_mount_source = env
    .data_mount_point_source
    .unwrap_or_else(|| data_mount_destination.clone());

  let ssh_private_key = maybe_read_item_from_file(
    "SSH_PRIVATE_KEY",
    env.ssh_private_key_file,
    env.ssh_private_key,
  )?
  .filter(|key| !key.is_empty());
  let ssh_passphrase = maybe_read_item_from_file(
    "SSH_PRIVATE_KEY_PASSPHRASE",
    env.ssh_private_key_passphrase_file,
    env.ssh_private_key_passphrase,
  )?;
  let ssh = match &ssh_private_key {
    Some(key) => Some(
      git::init_ssh_material(
        key,
        ssh_passphrase.as_deref(),
        &data_mount_destination.join("ssh"),
      )
      .context("failed to prepare ssh key material")?,
    ),
    None => None,
  };

  let poll_config = match maybe_read_item_from_file(
    "POLL_CONFIG",
    env.poll_config_file,
    env.poll_config,
  )? {
    Some(raw) if !raw.trim().is_empty() => Some(raw),
    _ => None,
  };

  let secret_provider = SecretProviderConfig {
    provider: env
      .secret_provider
      .unwrap_or_default()
      .trim()
      .to_lowercase(),
    address: env.secret_provider_address.unwrap_or_default(),
    token: env
      .secret_provider_token
      .filter(|token| !token.is_empty()),
    token_file: env.secret_provider_token_file,
    namespace: env.secret_provider_namespace,
    url: env.secret_provider_url.unwrap_or_default(),
    method: env
      .secret_provider_method
      .unwrap_or_else(|| String::from("GET")),
    body: env.secret_provider_body,
    value_pointer: env
      .secret_provider_value_pointer
      .unwrap_or_else(|| String::from("/value")),
  };

  let config = CoreConfig {
    http_port: env.http_port.unwrap_or(80),
    logging: LogConfig {
      level: env.log_level.unwrap_or_default(),
      stdio: env.log_stdio.unwrap_or_default(),
      pretty: env.log_pretty.unwrap_or_default(),
    },
    webhook_secret,
    git_access_token,
    auth_type: env
      .auth_type
      .filter(|auth_type| !auth_type.is_empty())
      .unwrap_or_else(|| String::from("oauth2")),
    skip_tls_verification: env
      .skip_tls_verification
      .unwrap_or_default(),
    http_proxy: env.http_proxy.filter(|proxy| !proxy.is_empty()),
    ssh,
    api_secret: maybe_read_item_from_file(
      "API_SECRET",
      env.api_secret_file,
      env.api_secret,
    )?
    .filter(|secret| !secret.is_empty()),
    secret_provider,
    sops_age_key: maybe_read_item_from_file(
      "SOPS_AGE_KEY",
      env.sops_age_key_file,
      env.sops_age_key,
    )?,
    notification_url: maybe_read_item_from_file(
      "NOTIFICATION_URL",
      env.notification_url_file,
      env.notification_url,
    )?,
    notification_provider: env
      .notification_provider
      .unwrap_or_default()
      .trim()
      .to_lowercase(),
    max_deployment_loop_count: env
      .max_deployment_loop_count
      .unwrap_or(3),
    data_mount_source,
    data_mount_destination,
    deploy_config_base_dir: env
      .deploy_config_base_dir
      .filter(|dir| !dir.is_empty())
      .unwrap_or_else(|| String::from(".")),
    env_files_dir: env.env_files_dir,
    poll_config,
    swarm_mode: env.docker_swarm_features.unwrap_or_default(),
    clone_submodules: env.git_clone_submodules.unwrap_or_default(),
  };

  validate_config(&config)?;

  Ok(config)
}

fn validate_config(config: &CoreConfig) -> anyhow::Result<()> {
  if config.webhook_secret.is_empty() {
    anyhow::bail!("WEBHOOK_SECRET must not be empty");
  }
  if let Some(proxy) = &config.http_proxy
    && !proxy.starts_with("http://")
    && !proxy.starts_with("https://")
  {
    anyhow::bail!("HTTP_PROXY must be an http(s) url, got '{proxy}'");
  }
  match config.secret_provider.provider.as_str() {
    "" => {}
    "vault" => {
      if config.secret_provider.address.is_empty() {
        anyhow::bail!(
          "SECRET_PROVIDER_ADDRESS is required for SECRET_PROVIDER=vault"
        );
      }
    }
    "webhook" => {
      if config.secret_provider.url.is_empty() {
        anyhow::bail!(
          "SECRET_PROVIDER_URL is required for SECRET_PROVIDER=webhook"
        );
      }
    }
    other => {
      anyhow::bail!("unknown SECRET_PROVIDER '{other}'")
    }
  }
  if !matches!(
    config.notification_provider.as_str(),
    "" | "webhook" | "ntfy" | "pushover"
  ) {
    anyhow::bail!(
      "unknown NOTIFICATION_PROVIDER '{}'",
      config.notification_provider
    );
  }
  if !config.data_mount_destination.is_absolute() {
    anyhow::bail!("DATA_MOUNT_POINT_DESTINATION must be absolute");
  }
  if !config.data_mount_source.is_absolute() {
    anyhow::bail!("DATA_MOUNT_POINT_SOURCE must be absolute");
  }
  Ok(())
}

impl CoreConfig {
  /// Container-visible root of the repository cache.
  pub fn internal_repo_root(&self) -> PathBuf {
    self.data_mount_destination.join("repos")
  }

  /// Host-visible root of the repository cache, the same
  /// relative suffixes as [Self::internal_repo_root].
  pub fn external_repo_root(&self) -> PathBuf {
    self.data_mount_source.join("repos")
  }

  /// Loggable version of the config, secrets masked.
  pub fn sanitized(&self) -> String {
    format!(
      "CoreConfig {{ http_port: {}, log: {:?}, webhook_secret: {}, git_access_token: {}, auth_type: {}, skip_tls_verification: {}, http_proxy: {:?}, ssh: {}, api_secret: {}, secret_provider: {:?}, notification_url: {:?}, max_deployment_loop_count: {}, data_mount: {:?} -> {:?}, deploy_config_base_dir: {:?}, poll_config: {}, swarm_mode: {}, clone_submodules: {} }}",
      self.http_port,
      self.logging,
      mask(Some(self.webhook_secret.as_str())),
      mask(self.git_access_token.as_deref()),
      self.auth_type,
      self.skip_tls_verification,
      self.http_proxy,
      if self.ssh.is_some() { "<configured>" } else { "<none>" },
      mask(self.api_secret.as_deref()),
      self.secret_provider.provider,
      self.notification_url,
      self.max_deployment_loop_count,
      self.data_mount_source,
      self.data_mount_destination,
      self.deploy_config_base_dir,
      if self.poll_config.is_some() { "<configured>" } else { "<none>" },
      self.swarm_mode,
      self.clone_submodules,
    )
  }
}

fn mask(value: Option<&str>) -> &'static str {
  match value {
    Some(value) if !value.is_empty() => "<set>",
    _ => "<unset>",
  }
}
