use std::path::Path;

use anyhow::{Context, anyhow};
use command::run_doco_command;

use crate::{GitError, GitRef, RepoExecutionArgs};

/// One entry of a diff between two commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
  pub old: String,
  pub new: String,
}

/// Whether the local HEAD already is the latest commit for the
/// reference. Branch / tag references are resolved against the
/// remote; a pinned commit only needs a local comparison.
#[tracing::instrument(level = "debug", skip(args), fields(repo = %args.name))]
pub async fn matches_head(
  args: &RepoExecutionArgs,
) -> anyhow::Result<bool> {
  if !args.destination.join(".git").exists() {
    return Ok(false);
  }
  let head = run_doco_command(
    "Resolve HEAD",
    args.destination.as_path(),
    "git rev-parse HEAD",
  )
  .await;
  if !head.success {
    return Ok(false);
  }
  let head = head.stdout.trim().to_lowercase();

  if let GitRef::Commit(sha) = &args.reference {
    return Ok(&head == sha);
  }

  let remote = resolve_remote_sha(args).await?;
  Ok(head == remote)
}

/// Resolves the reference against the remote with ls-remote.
/// Branch wins over tag for short names; annotated tags use the
/// peeled commit.
async fn resolve_remote_sha(
  args: &RepoExecutionArgs,
) -> anyhow::Result<String> {
  let patterns = match &args.reference {
    GitRef::Branch(name) => format!("'refs/heads/{name}'"),
    GitRef::Tag(name) => {
      format!("'refs/tags/{name}' 'refs/tags/{name}^{{}}'")
    }
    GitRef::Short(name) => format!(
      "'refs/heads/{name}' 'refs/tags/{name}' 'refs/tags/{name}^{{}}'"
    ),
    GitRef::Commit(sha) => return Ok(sha.clone()),
  };
  let log = run_doco_command(
    "Resolve Remote",
    args.destination.as_path(),
    format!(
      "{}git{} ls-remote origin {patterns}",
      args.env_prefix(),
      args.config_args(),
    ),
  )
  .await;
  if !log.success {
    return Err(anyhow!("{}", log.stderr))
      .context("failed to list remote references");
  }

  let mut branch = None;
  let mut tag = None;
  let mut peeled_tag = None;
  for line in log.stdout.lines() {
    let Some((sha, reference)) = line.split_once('\t') else {
      continue;
    };
    let sha = sha.trim().to_lowercase();
    let reference = reference.trim();
    if reference.starts_with("refs/heads/") {
      branch.get_or_insert(sha);
    } else if reference.ends_with("^{}") {
      peeled_tag.get_or_insert(sha);
    } else if reference.starts_with("refs/tags/") {
      tag.get_or_insert(sha);
    }
  }
  branch.or(peeled_tag).or(tag).ok_or_else(|| {
    GitError::InvalidReference(args.reference.to_string()).into()
  })
}

/// Latest commit sha for the reference, resolved locally.
/// The working tree is expected to be at the reference already.
pub async fn latest_commit(
  repo_dir: &Path,
  reference: &GitRef,
) -> anyhow::Result<String> {
  if let GitRef::Commit(sha) = reference {
    return Ok(sha.clone());
  }
  let name = reference.short_name();
  for candidate in
    [name.to_string(), format!("origin/{name}"), String::from("HEAD")]
  {
    let log = run_doco_command(
      "Resolve Commit",
      repo_dir,
      format!(
        "git rev-parse --verify --end-of-options '{candidate}^{{commit}}'"
      ),
    )
    .await;
    if log.success {
      let sha = log.stdout.trim().to_lowercase();
      if sha.len() == 40 {
        return Ok(sha);
      }
    }
  }
  Err(GitError::InvalidReference(reference.to_string()).into())
}

/// Shortest unique abbreviation of the sha, at least `min_len`.
pub async fn short_unique_sha(
  repo_dir: &Path,
  sha: &str,
  min_len: usize,
) -> String {
  let log = run_doco_command(
    "Short SHA",
    repo_dir,
    format!("git rev-parse --short={min_len} {sha}"),
  )
  .await;
  if log.success {
    let short = log.stdout.trim();
    if !short.is_empty() {
      return short.to_string();
    }
  }
  sha.chars().take(min_len).collect()
}

/// (old, new) path pairs changed between two commits, renames
/// followed. Fails when either commit is missing locally, eg
/// beyond a shallow clone's history.
pub async fn changed_files_between(
  repo_dir: &Path,
  sha_a: &str,
  sha_b: &str,
) -> anyhow::Result<Vec<ChangedFile>> {
  let log = run_doco_command(
    "Diff Commits",
    repo_dir,
    format!(
      "git diff --name-status --find-renames {sha_a} {sha_b}"
    ),
  )
  .await;
  if !log.success {
    return Err(anyhow!("{}", log.stderr)).with_context(|| {
      format!("failed to diff {sha_a}..{sha_b}")
    });
  }
  Ok(parse_name_status(&log.stdout))
}

fn parse_name_status(output: &str) -> Vec<ChangedFile> {
  let mut files = Vec::new();
  for line in output.lines() {
    let mut fields = line.split('\t');
    let Some(status) = fields.next() else {
      continue;
    };
    match (status.chars().next(), fields.next(), fields.next()) {
      (Some('R') | Some('C'), Some(old), Some(new)) => {
        files.push(ChangedFile {
          old: old.to_string(),
          new: new.to_string(),
        });
      }
      (Some(_), Some(path), None) => files.push(ChangedFile {
        old: path.to_string(),
        new: path.to_string(),
      }),
      _ => {}
    }
  }
  files
}

/// Whether any changed file falls under `subdir` (repo-relative).
/// The repository root matches everything.
pub fn has_changes_in_subdir(
  files: &[ChangedFile],
  subdir: &Path,
) -> bool {
  let subdir = paths::clean(subdir);
  if subdir == Path::new(".") {
    return !files.is_empty();
  }
  files.iter().any(|file| {
    paths::clean(Path::new(&file.old)).starts_with(&subdir)
      || paths::clean(Path::new(&file.new)).starts_with(&subdir)
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_name_status_output() {
    let out = "M\tservices/a/compose.yaml\nA\tREADME.md\nD\told.env\nR100\tservices/b/old.yaml\tservices/b/new.yaml\n";
    let files = parse_name_status(out);
    assert_eq!(files.len(), 4);
    assert_eq!(files[0].old, "services/a/compose.yaml");
    assert_eq!(files[0].new, "services/a/compose.yaml");
    assert_eq!(files[3].old, "services/b/old.yaml");
    assert_eq!(files[3].new, "services/b/new.yaml");
  }

  #[test]
  fn subdir_filter() {
    let files = parse_name_status("M\tservices/b/compose.yaml\n");
    assert!(!has_changes_in_subdir(
      &files,
      Path::new("services/a")
    ));
    assert!(has_changes_in_subdir(&files, Path::new("services/b")));
    assert!(has_changes_in_subdir(&files, Path::new(".")));
    assert!(has_changes_in_subdir(
      &files,
      Path::new("./services/b/")
    ));
    assert!(!has_changes_in_subdir(&[], Path::new(".")));
  }
}
