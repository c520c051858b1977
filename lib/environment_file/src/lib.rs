use std::path::PathBuf;

use anyhow::{Context, anyhow};

/// Resolves a secret configured either directly or through a
/// `*_FILE` companion variable. Exactly one of the pair may be
/// set; file contents are trimmed of trailing whitespace.
pub fn maybe_read_item_from_file(
  variable: &str,
  file: Option<PathBuf>,
  item: Option<String>,
) -> anyhow::Result<Option<String>> {
  match (file, item) {
    (Some(_), Some(_)) => Err(anyhow!(
      "both {variable} and {variable}_FILE are set, exactly one may be provided"
    )),
    (Some(file), None) => {
      let contents = std::fs::read_to_string(&file)
        .with_context(|| {
          format!("failed to read {variable}_FILE at {file:?}")
        })?;
      Ok(Some(contents.trim_end().to_string()))
    }
    (None, item) => Ok(item),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn direct_value_passes_through() {
    let res = maybe_read_item_from_file(
      "WEBHOOK_SECRET",
      None,
      Some(String::from("hunter2")),
    )
    .unwrap();
    assert_eq!(res.as_deref(), Some("hunter2"));
  }

  #[test]
  fn both_set_is_an_error() {
    let e = maybe_read_item_from_file(
      "WEBHOOK_SECRET",
      Some(PathBuf::from("/tmp/secret")),
      Some(String::from("hunter2")),
    )
    .unwrap_err();
    assert!(e.to_string().contains("WEBHOOK_SECRET"));
  }

  #[test]
  fn neither_set_is_none() {
    let res =
      maybe_read_item_from_file("API_SECRET", None, None).unwrap();
    assert!(res.is_none());
  }
}
