use std::sync::{Arc, OnceLock};

use cache::KeyedLock;
use tokio_util::sync::CancellationToken;

use crate::secret::SecretProvider;

/// Cancelled once on SIGTERM; every job holds a child token.
pub fn shutdown_token() -> &'static CancellationToken {
  static SHUTDOWN: OnceLock<CancellationToken> = OnceLock::new();
  SHUTDOWN.get_or_init(CancellationToken::new)
}

/// Per-repository mutual exclusion. Key is the derived repository
/// name; every RepoCache mutation for a repo happens under it.
pub fn repo_locks() -> &'static KeyedLock<String> {
  static REPO_LOCKS: OnceLock<KeyedLock<String>> = OnceLock::new();
  REPO_LOCKS.get_or_init(Default::default)
}

/// The configured external secret backend, if any.
/// Initialized once at startup so construction errors crash early.
pub fn secret_provider() -> Option<&'static Arc<dyn SecretProvider>>
{
  secret_provider_cell().get().and_then(Option::as_ref)
}

pub fn init_secret_provider() {
  let provider = match crate::secret::build_provider(
    &crate::config::core_config().secret_provider,
  ) {
    Ok(provider) => provider,
    Err(e) => {
      error!("failed to initialize secret provider | {e:#}");
      std::process::exit(1)
    }
  };
  if let Some(provider) = &provider {
    info!("🔐 Secret Provider: {}", provider.name());
  }
  let _ = secret_provider_cell().set(provider);
}

fn secret_provider_cell()
-> &'static OnceLock<Option<Arc<dyn SecretProvider>>> {
  static SECRET_PROVIDER: OnceLock<
    Option<Arc<dyn SecretProvider>>,
  > = OnceLock::new();
  &SECRET_PROVIDER
}
