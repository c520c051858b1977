use std::path::{Component, Path, PathBuf};

/// Mode for directories created by doco-cd.
pub const DIR_MODE: u32 = 0o755;
/// Mode for files holding credentials (ssh keys, askpass helpers).
pub const OWNER_FILE_MODE: u32 = 0o600;
/// Mode for world-readable generated files (env files, overrides).
pub const PUBLIC_FILE_MODE: u32 = 0o644;

#[derive(Debug, thiserror::Error)]
#[error("path {path:?} escapes trusted root {root:?}")]
pub struct PathTraversal {
  pub path: PathBuf,
  pub root: PathBuf,
}

/// Lexically cleans `path`, absolutizes it under `trusted_root`
/// when relative, and requires the result to stay under the root.
/// Every path originating from configuration or a webhook payload
/// must pass through here before touching the filesystem.
pub fn verify_and_sanitize(
  path: impl AsRef<Path>,
  trusted_root: impl AsRef<Path>,
) -> Result<PathBuf, PathTraversal> {
  let root = clean(trusted_root.as_ref());
  let path = path.as_ref();
  let abs = if path.is_absolute() {
    clean(path)
  } else {
    clean(&root.join(path))
  };
  if abs == root || abs.starts_with(&root) {
    Ok(abs)
  } else {
    Err(PathTraversal {
      path: abs,
      root,
    })
  }
}

/// Removes `.` components and resolves `..` lexically,
/// without touching the filesystem.
pub fn clean(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        // Only pop real names. A leading '..' on a relative
        // path has to survive so locality checks can see it.
        if matches!(
          out.components().next_back(),
          Some(Component::Normal(_))
        ) {
          out.pop();
        } else if !matches!(
          out.components().next_back(),
          Some(Component::RootDir)
        ) {
          out.push("..");
        }
      }
      other => out.push(other),
    }
  }
  if out.as_os_str().is_empty() {
    out.push(".");
  }
  out
}

/// A path is local when, after cleaning, it is relative and does
/// not reach outside its own directory.
pub fn is_local(path: impl AsRef<Path>) -> bool {
  let cleaned = clean(path.as_ref());
  !cleaned.is_absolute()
    && !matches!(
      cleaned.components().next(),
      Some(Component::ParentDir)
    )
}

/// True when `name` is a bare file name with no directory part.
pub fn is_basename(name: &str) -> bool {
  !name.is_empty()
    && Path::new(name)
      .file_name()
      .is_some_and(|base| base == Path::new(name).as_os_str())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sanitize_keeps_paths_under_root() {
    let res =
      verify_and_sanitize("repos/acme/app", "/data").unwrap();
    assert_eq!(res, PathBuf::from("/data/repos/acme/app"));
  }

  #[test]
  fn sanitize_accepts_the_root_itself() {
    let res = verify_and_sanitize("/data", "/data").unwrap();
    assert_eq!(res, PathBuf::from("/data"));
  }

  #[test]
  fn sanitize_rejects_escapes() {
    verify_and_sanitize("../../etc/passwd", "/data").unwrap_err();
    verify_and_sanitize("repos/../../etc", "/data").unwrap_err();
    verify_and_sanitize("/etc/passwd", "/data").unwrap_err();
  }

  #[test]
  fn sanitize_result_has_root_prefix() {
    for path in
      ["a", "a/b/../c", "./x", "x/./y", "deep/../../data-x"]
    {
      if let Ok(out) = verify_and_sanitize(path, "/data") {
        assert!(out.starts_with("/data"), "{path} -> {out:?}");
      }
    }
  }

  #[test]
  fn clean_strips_dot_and_resolves_dotdot() {
    assert_eq!(clean(Path::new("a/./b/../c")), PathBuf::from("a/c"));
    assert_eq!(clean(Path::new("./x")), PathBuf::from("x"));
    assert_eq!(clean(Path::new("../x")), PathBuf::from("../x"));
    assert_eq!(clean(Path::new("")), PathBuf::from("."));
    assert_eq!(clean(Path::new("/a/../..")), PathBuf::from("/"));
  }

  #[test]
  fn locality() {
    assert!(is_local("services/app"));
    assert!(is_local("./services"));
    assert!(is_local("."));
    assert!(!is_local("../other"));
    assert!(!is_local("a/../../other"));
    assert!(!is_local("/abs"));
  }

  #[test]
  fn basenames() {
    assert!(is_basename("compose.yaml"));
    assert!(!is_basename("sub/compose.yaml"));
    assert!(!is_basename("../compose.yaml"));
    assert!(!is_basename(""));
  }
}
