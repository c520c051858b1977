use std::{
  collections::HashMap,
  os::unix::fs::PermissionsExt,
  path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use command::{Log, run_doco_command};
use indexmap::IndexMap;
use shell_escape::escape;

use crate::{
  config::core_config,
  resolve::{DeployConfig, DestroyOpts, EnvFileEntry},
  sops,
};

/// Environment file generated next to the compose files, holding
/// parsed env-file entries overlaid with resolved secrets.
const GENERATED_ENV_FILE: &str = ".doco-cd.env";
/// Override file injecting the management labels per service.
const OVERRIDE_FILE: &str = ".doco-cd.override.yaml";

pub struct DeployArgs<'a> {
  pub config: &'a DeployConfig,
  /// Stack working directory, container-visible.
  pub internal_dir: &'a Path,
  /// Stack working directory, host-visible. Relative paths in
  /// compose files resolve against this at apply time.
  pub external_dir: &'a Path,
  /// Labels stamped on every service (§ label schema).
  pub labels: Vec<(String, String)>,
  pub secrets: &'a HashMap<String, String>,
}

/// Applies the stack with `docker compose up` (or
/// `docker stack deploy` in swarm mode). Returns the command logs;
/// the first failing command is an error.
pub async fn deploy_stack(
  args: DeployArgs<'_>,
) -> anyhow::Result<Vec<Log>> {
  let DeployArgs {
    config,
    internal_dir,
    external_dir,
    labels,
    secrets,
  } = args;
  let mut logs = Vec::new();

  sops::decrypt_directory(internal_dir)
    .await
    .context("failed to decrypt working directory")?;

  let files = present_compose_files(internal_dir, config)?;

  let (env_file, remote_env_files) =
    assemble_environment(config, internal_dir, secrets).await?;

  let services = list_services(config, internal_dir, &files).await?;
  let override_file = write_override_file(
    internal_dir,
    &services,
    &labels,
    core_config().swarm_mode,
  )?;

  if core_config().swarm_mode {
    let log =
      swarm_deploy(config, &files, &override_file, env_file.as_deref())
        .await;
    push_checked(&mut logs, log, "swarm deploy failed")?;
    return Ok(logs);
  }

  if !config.build_opts.is_none() {
    let log = run_doco_command(
      "Compose Build",
      internal_dir,
      build_command(config, &files),
    )
    .await;
    push_checked(&mut logs, log, "compose build failed")?;
  }

  let log = run_doco_command(
    "Compose Up",
    internal_dir,
    up_command(
      config,
      external_dir,
      &files,
      &override_file,
      env_file.as_deref(),
      &remote_env_files,
    ),
  )
  .await;
  push_checked(&mut logs, log, "compose up failed")?;

  Ok(logs)
}

/// Takes the stack down. `remove_dir` is handled by the destroy
/// stage, not here.
pub async fn destroy_stack(
  project: &str,
  opts: DestroyOpts,
) -> anyhow::Result<Vec<Log>> {
  let mut logs = Vec::new();
  let command = if core_config().swarm_mode {
    format!("docker stack rm {}", escape(project.into()))
  } else {
    let mut command = format!(
      "docker compose -p {} down --remove-orphans",
      escape(project.into())
    );
    if opts.remove_volumes {
      command.push_str(" --volumes");
    }
    if opts.remove_images {
      command.push_str(" --rmi all");
    }
    command
  };
  let log = run_doco_command("Compose Down", None, command).await;
  push_checked(&mut logs, log, "failed to destroy stack")?;
  Ok(logs)
}

/// `docker compose pull` for the force-image-pull change signal.
pub async fn pull(
  project: &str,
  working_dir: &Path,
  compose_files: &[String],
) -> Log {
  let files = compose_files
    .iter()
    .filter(|file| working_dir.join(file.as_str()).is_file())
    .map(|file| {
      format!(" -f {}", escape(file.as_str().into()))
    })
    .collect::<String>();
  run_doco_command(
    "Compose Pull",
    working_dir,
    format!(
      "docker compose -p {}{files} pull",
      escape(project.into())
    ),
  )
  .await
}

fn push_checked(
  logs: &mut Vec<Log>,
  log: Log,
  context: &str,
) -> anyhow::Result<()> {
  let success = log.success;
  let detail = log.combined();
  logs.push(log);
  if success {
    Ok(())
  } else {
    Err(anyhow!("{detail}").context(context.to_string()))
  }
}

/// The descriptor's compose files that actually exist in the
/// working directory. At least one must.
fn present_compose_files(
  internal_dir: &Path,
  config: &DeployConfig,
) -> anyhow::Result<Vec<String>> {
  let files = config
    .compose_files
    .iter()
    .filter(|file| internal_dir.join(file.as_str()).is_file())
    .cloned()
    .collect::<Vec<_>>();
  if files.is_empty() {
    anyhow::bail!(
      "no compose file found in {:?}, looked for {:?}",
      internal_dir,
      config.compose_files
    );
  }
  Ok(files)
}

/// Parses env-file entries, overlays resolved secrets (secrets
/// win), and writes the generated env file. Returns its path and
/// the `remote:` entries deferred to the engine.
async fn assemble_environment(
  config: &DeployConfig,
  internal_dir: &Path,
  secrets: &HashMap<String, String>,
) -> anyhow::Result<(Option<PathBuf>, Vec<String>)> {
  let mut environment: IndexMap<String, String> = IndexMap::new();
  let mut remote = Vec::new();

  for entry in &config.env_files {
    match EnvFileEntry::parse(entry) {
      EnvFileEntry::Tree(relative) => {
        let path =
          paths::verify_and_sanitize(&relative, internal_dir)
            .context("env file escapes the working directory")?;
        if !path.is_file() {
          if relative == ".env" {
            continue;
          }
          anyhow::bail!("env file '{relative}' does not exist");
        }
        read_env_file(&path, &mut environment).await?;
      }
      EnvFileEntry::Trusted(relative) => {
        let trusted_dir = core_config()
          .env_files_dir
          .as_ref()
          .context("file: env entries need ENV_FILES_DIR")?;
        let path =
          paths::verify_and_sanitize(&relative, trusted_dir)
            .context("env file escapes the trusted directory")?;
        if !path.is_file() {
          anyhow::bail!("env file 'file:{relative}' does not exist");
        }
        read_env_file(&path, &mut environment).await?;
      }
      EnvFileEntry::Remote(relative) => remote.push(relative),
    }
  }

  for (key, value) in secrets {
    environment.insert(key.clone(), value.clone());
  }

  if environment.is_empty() {
    return Ok((None, remote));
  }

  let contents = environment
    .iter()
    .map(|(key, value)| {
      format!("{key}={}", quote_env_value(value))
    })
    .collect::<Vec<_>>()
    .join("\n");
  let path = internal_dir.join(GENERATED_ENV_FILE);
  tokio::fs::write(&path, contents).await.with_context(|| {
    format!("failed to write environment file {path:?}")
  })?;
  std::fs::set_permissions(
    &path,
    std::fs::Permissions::from_mode(paths::OWNER_FILE_MODE),
  )?;
  Ok((Some(path), remote))
}

async fn read_env_file(
  path: &Path,
  environment: &mut IndexMap<String, String>,
) -> anyhow::Result<()> {
  // Encrypted files are decrypted in memory, plaintext stays off
  // the disk.
  let contents = sops::read_maybe_encrypted(path).await?;
  for item in
    dotenvy::from_read_iter(std::io::Cursor::new(contents))
  {
    let (key, value) = item
      .with_context(|| format!("invalid env file {path:?}"))?;
    environment.insert(key, value);
  }
  Ok(())
}

/// Values compose and a sourcing shell both read back correctly.
fn quote_env_value(value: &str) -> String {
  let plain = value.chars().all(|c| {
    c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c)
  });
  if plain && !value.is_empty() {
    return value.to_string();
  }
  let mut quoted = String::with_capacity(value.len() + 2);
  quoted.push('"');
  for c in value.chars() {
    if matches!(c, '"' | '\\' | '$' | '`') {
      quoted.push('\\');
    }
    quoted.push(c);
  }
  quoted.push('"');
  quoted
}

/// Service names via `docker compose config --services`.
async fn list_services(
  config: &DeployConfig,
  internal_dir: &Path,
  files: &[String],
) -> anyhow::Result<Vec<String>> {
  let log = run_doco_command(
    "Compose Config",
    internal_dir,
    format!(
      "docker compose -p {}{} config --services",
      escape(config.name.as_str().into()),
      file_args(files),
    ),
  )
  .await;
  if !log.success {
    return Err(anyhow!("{}", log.combined()))
      .context("failed to enumerate compose services");
  }
  Ok(
    log
      .stdout
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(str::to_string)
      .collect(),
  )
}

/// Writes the label override compose file. Swarm services carry
/// their labels under `deploy.labels`, plain compose under
/// `labels`.
fn write_override_file(
  internal_dir: &Path,
  services: &[String],
  labels: &[(String, String)],
  swarm: bool,
) -> anyhow::Result<String> {
  use serde_yaml_ng::{Mapping, Value};

  let label_map = labels
    .iter()
    .map(|(key, value)| {
      (Value::from(key.as_str()), Value::from(value.as_str()))
    })
    .collect::<Mapping>();
  let labels_entry = Value::Mapping(
    [(Value::from("labels"), Value::Mapping(label_map))]
      .into_iter()
      .collect(),
  );
  let per_service = if swarm {
    Value::Mapping(
      [(Value::from("deploy"), labels_entry)]
        .into_iter()
        .collect(),
    )
  } else {
    labels_entry
  };
  let services_map = services
    .iter()
    .map(|service| {
      (Value::from(service.as_str()), per_service.clone())
    })
    .collect::<Mapping>();
  let document = Value::Mapping(
    [(Value::from("services"), Value::Mapping(services_map))]
      .into_iter()
      .collect(),
  );
  let contents = serde_yaml_ng::to_string(&document)
    .context("failed to serialize label override")?;
  let path = internal_dir.join(OVERRIDE_FILE);
  std::fs::write(&path, contents).with_context(|| {
    format!("failed to write override file {path:?}")
  })?;
  std::fs::set_permissions(
    &path,
    std::fs::Permissions::from_mode(paths::PUBLIC_FILE_MODE),
  )?;
  Ok(OVERRIDE_FILE.to_string())
}

fn file_args(files: &[String]) -> String {
  files
    .iter()
    .map(|file| format!(" -f {}", escape(file.as_str().into())))
    .collect()
}

fn build_command(
  config: &DeployConfig,
  files: &[String],
) -> String {
  let mut command = format!(
    "docker compose -p {}{} build",
    escape(config.name.as_str().into()),
    file_args(files),
  );
  if config.build_opts.force_pull {
    command.push_str(" --pull");
  }
  if config.build_opts.no_cache {
    command.push_str(" --no-cache");
  }
  if config.build_opts.quiet {
    command.push_str(" --quiet");
  }
  for (key, value) in &config.build_opts.args {
    command.push_str(&format!(
      " --build-arg {}",
      escape(format!("{key}={value}").into())
    ));
  }
  command
}

fn up_command(
  config: &DeployConfig,
  external_dir: &Path,
  files: &[String],
  override_file: &str,
  env_file: Option<&Path>,
  remote_env_files: &[String],
) -> String {
  let mut command = String::new();
  if !config.profiles.is_empty() {
    command.push_str(&format!(
      "COMPOSE_PROFILES={} ",
      escape(config.profiles.join(",").into())
    ));
  }
  command.push_str(&format!(
    "docker compose -p {} --project-directory {}{}",
    escape(config.name.as_str().into()),
    escape(external_dir.to_string_lossy()),
    file_args(files),
  ));
  command.push_str(&format!(
    " -f {}",
    escape(override_file.into())
  ));
  if let Some(env_file) = env_file {
    command.push_str(&format!(
      " --env-file {}",
      escape(env_file.to_string_lossy())
    ));
  }
  for remote in remote_env_files {
    command.push_str(&format!(
      " --env-file {}",
      escape(remote.as_str().into())
    ));
  }
  command.push_str(" up -d");
  if config.remove_orphans {
    command.push_str(" --remove-orphans");
  }
  if config.force_recreate {
    command.push_str(" --force-recreate");
  }
  if config.force_image_pull {
    command.push_str(" --pull always");
  }
  command
}

async fn swarm_deploy(
  config: &DeployConfig,
  files: &[String],
  override_file: &str,
  env_file: Option<&Path>,
) -> Log {
  let mut command = String::new();
  if let Some(env_file) = env_file {
    // Swarm has no --env-file, source the generated one instead.
    command.push_str(&format!(
      "set -a && . {} && set +a && ",
      escape(env_file.to_string_lossy())
    ));
  }
  command.push_str("docker stack deploy");
  for file in files {
    command.push_str(&format!(
      " --compose-file {}",
      escape(file.as_str().into())
    ));
  }
  command.push_str(&format!(
    " --compose-file {} {}",
    escape(override_file.into()),
    escape(config.name.as_str().into()),
  ));
  run_doco_command("Stack Deploy", None, command).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::resolve::default_deploy_config;

  #[test]
  fn up_command_carries_descriptor_flags() {
    let mut config = default_deploy_config("web", "main");
    config.force_recreate = true;
    config.force_image_pull = true;
    config.profiles = vec![String::from("prod")];
    let command = up_command(
      &config,
      Path::new("/data/repos/github.com/acme/app"),
      &[String::from("compose.yaml")],
      OVERRIDE_FILE,
      Some(Path::new("/data/repos/github.com/acme/app/.doco-cd.env")),
      &[String::from("runtime.env")],
    );
    assert!(command.starts_with("COMPOSE_PROFILES=prod "));
    assert!(command.contains("-p web"));
    assert!(command.contains(
      "--project-directory /data/repos/github.com/acme/app"
    ));
    assert!(command.contains("-f compose.yaml"));
    assert!(command.contains(&format!("-f {OVERRIDE_FILE}")));
    assert!(command.contains("--env-file runtime.env"));
    assert!(command.ends_with(
      "up -d --remove-orphans --force-recreate --pull always"
    ));
  }

  #[test]
  fn build_command_carries_build_opts() {
    let mut config = default_deploy_config("web", "main");
    config.build_opts.no_cache = true;
    config.build_opts.force_pull = true;
    config
      .build_opts
      .args
      .insert(String::from("GIT_SHA"), String::from("abc"));
    let command =
      build_command(&config, &[String::from("compose.yaml")]);
    assert!(command.contains("build --pull --no-cache"));
    assert!(command.contains("--build-arg GIT_SHA=abc"));
  }

  #[test]
  fn env_values_quoted_for_compose_and_shell() {
    assert_eq!(quote_env_value("plain-1.2:3"), "plain-1.2:3");
    assert_eq!(
      quote_env_value("has space"),
      "\"has space\""
    );
    assert_eq!(
      quote_env_value("a\"b$c"),
      "\"a\\\"b\\$c\""
    );
    assert_eq!(quote_env_value(""), "\"\"");
  }
}
