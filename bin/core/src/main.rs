#[macro_use]
extern crate tracing;

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;

use crate::config::core_config;

mod alert;
mod api;
mod change;
mod config;
mod dispatch;
mod docker;
mod listener;
mod metrics;
mod poll;
mod resolve;
mod secret;
mod sops;
mod stage;
mod state;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = core_config();
  logger::init(&config.logging)?;

  info!("doco-cd version: v{}", env!("CARGO_PKG_VERSION"));
  info!("{}", config.sanitized());

  // Crash early on a broken daemon socket or secret backend.
  docker::docker_client();
  state::init_secret_provider();
  metrics::init_info();

  tokio::fs::create_dir_all(config.internal_repo_root())
    .await
    .context("failed to create repository cache directory")?;

  poll::spawn_poll_workers()
    .context("invalid poll configuration")?;

  let addr =
    SocketAddr::from(([0, 0, 0, 0], config.http_port));
  info!("doco-cd starting on http://{addr}");

  let mut server = axum_server::bind(addr);
  server
    .http_builder()
    .http1()
    .timer(hyper_util::rt::TokioTimer::new())
    .header_read_timeout(Duration::from_secs(3));
  server
    .serve(api::router().into_make_service())
    .await
    .context("failed to start http server")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  let res = tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => Ok(()),
  };
  // Stop in-flight jobs and let queued notifications drain.
  state::shutdown_token().cancel();
  if let Some(provider) = state::secret_provider() {
    provider.close().await;
  }
  alert::flush().await;
  res
}
