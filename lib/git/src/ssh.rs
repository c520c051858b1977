use std::{
  os::unix::fs::PermissionsExt,
  path::{Path, PathBuf},
  sync::OnceLock,
};

use anyhow::Context;
use run_command::async_run_command;
use tokio::sync::Mutex;

/// On-disk ssh identity prepared once at startup.
#[derive(Debug, Clone)]
pub struct SshMaterial {
  pub key_path: PathBuf,
  pub known_hosts_path: PathBuf,
  /// Present when the key has a passphrase.
  pub askpass_path: Option<PathBuf>,
}

impl SshMaterial {
  pub fn env_prefix(&self) -> String {
    let base = format!(
      "GIT_SSH_COMMAND='ssh -i {} -o UserKnownHostsFile={} -o StrictHostKeyChecking=yes' ",
      self.key_path.display(),
      self.known_hosts_path.display(),
    );
    match &self.askpass_path {
      Some(askpass) => format!(
        "SSH_ASKPASS='{}' SSH_ASKPASS_REQUIRE=force DISPLAY=:0 {base}",
        askpass.display()
      ),
      None => base,
    }
  }
}

/// Writes the private key (0600), the optional askpass helper
/// (0700), and creates the known-hosts file if missing.
pub fn init_ssh_material(
  private_key: &str,
  passphrase: Option<&str>,
  dir: &Path,
) -> anyhow::Result<SshMaterial> {
  std::fs::create_dir_all(dir).with_context(|| {
    format!("failed to create ssh directory {dir:?}")
  })?;
  std::fs::set_permissions(
    dir,
    std::fs::Permissions::from_mode(paths::DIR_MODE),
  )?;

  let key_path = dir.join("id");
  let mut key = private_key.trim_end().to_string();
  key.push('\n');
  std::fs::write(&key_path, key)
    .with_context(|| format!("failed to write ssh key to {key_path:?}"))?;
  std::fs::set_permissions(
    &key_path,
    std::fs::Permissions::from_mode(paths::OWNER_FILE_MODE),
  )?;

  let askpass_path = match passphrase {
    Some(passphrase) if !passphrase.is_empty() => {
      let askpass_path = dir.join("askpass.sh");
      let escaped = passphrase.replace('\'', r"'\''");
      std::fs::write(
        &askpass_path,
        format!("#!/bin/sh\necho '{escaped}'\n"),
      )
      .context("failed to write askpass helper")?;
      std::fs::set_permissions(
        &askpass_path,
        std::fs::Permissions::from_mode(0o700),
      )?;
      Some(askpass_path)
    }
    _ => None,
  };

  let known_hosts_path = dir.join("known_hosts");
  // First writer wins, an existing file is left alone.
  match std::fs::OpenOptions::new()
    .write(true)
    .create_new(true)
    .open(&known_hosts_path)
  {
    Ok(_) => {
      std::fs::set_permissions(
        &known_hosts_path,
        std::fs::Permissions::from_mode(paths::OWNER_FILE_MODE),
      )?;
    }
    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
    Err(e) => {
      return Err(e).with_context(|| {
        format!("failed to create {known_hosts_path:?}")
      });
    }
  }

  Ok(SshMaterial {
    key_path,
    known_hosts_path,
    askpass_path,
  })
}

fn known_hosts_write_lock() -> &'static Mutex<()> {
  static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
  LOCK.get_or_init(Default::default)
}

/// Scans the host key and appends it to the known-hosts file,
/// once. Appends are serialized and deduplicated.
pub async fn ensure_known_host(
  host: &str,
  known_hosts_path: &Path,
) -> anyhow::Result<()> {
  let _guard = known_hosts_write_lock().lock().await;

  let existing = tokio::fs::read_to_string(known_hosts_path)
    .await
    .unwrap_or_default();
  if existing
    .lines()
    .any(|line| line.split_whitespace().next() == Some(host))
  {
    return Ok(());
  }

  let output =
    async_run_command(&format!("ssh-keyscan -T 10 {host}")).await;
  if !output.success() {
    return Err(anyhow::anyhow!("{}", output.stderr))
      .with_context(|| format!("ssh-keyscan failed for {host}"));
  }

  let mut additions = String::new();
  for line in output.stdout.lines() {
    let line = line.trim();
    if line.is_empty()
      || line.starts_with('#')
      || existing.lines().any(|known| known == line)
    {
      continue;
    }
    additions.push_str(line);
    additions.push('\n');
  }
  if additions.is_empty() {
    return Ok(());
  }

  let mut contents = existing;
  contents.push_str(&additions);
  tokio::fs::write(known_hosts_path, contents)
    .await
    .with_context(|| {
      format!("failed to append host keys to {known_hosts_path:?}")
    })
}
