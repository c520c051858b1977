use crate::{GitError, GitRes, RepoExecutionArgs};

/// Clone / update mix.
///   - Missing working tree: clone. Second tuple member is `true`.
///   - Existing tree (including a clone that lost the race and hit
///     [GitError::RepositoryAlreadyExists]): update.
#[tracing::instrument(level = "debug", skip(args), fields(repo = %args.name))]
pub async fn ensure_repository(
  args: &RepoExecutionArgs,
) -> anyhow::Result<(GitRes, bool)> {
  if args.destination.join(".git").exists() {
    return crate::update(args).await.map(|res| (res, false));
  }
  match crate::clone(args).await {
    Ok(res) => Ok((res, true)),
    Err(e)
      if e
        .downcast_ref::<GitError>()
        .is_some_and(|e| {
          matches!(e, GitError::RepositoryAlreadyExists(_))
        }) =>
    {
      crate::update(args).await.map(|res| (res, false))
    }
    Err(e) => Err(e),
  }
}
