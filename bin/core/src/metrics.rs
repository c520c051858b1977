use std::sync::OnceLock;

use anyhow::Context;
use prometheus::{
  Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec,
  Opts, Registry, TextEncoder,
};

use crate::config::core_config;

pub struct Metrics {
  registry: Registry,
  pub polls_total: IntCounterVec,
  pub poll_errors_total: IntCounterVec,
  pub webhook_requests_total: IntCounterVec,
  pub webhook_errors_total: IntCounterVec,
  pub deployments_total: IntCounterVec,
  pub deployment_errors_total: IntCounterVec,
  pub poll_duration: Histogram,
  pub webhook_duration: Histogram,
  pub deployment_duration: Histogram,
  pub info: IntGaugeVec,
}

pub fn metrics() -> &'static Metrics {
  static METRICS: OnceLock<Metrics> = OnceLock::new();
  METRICS.get_or_init(|| {
    init_metrics().expect("failed to register metrics")
  })
}

fn init_metrics() -> anyhow::Result<Metrics> {
  let registry = Registry::new();

  let counter = |name: &str, help: &str| {
    IntCounterVec::new(
      Opts::new(format!("doco_cd_{name}"), help),
      &["repository"],
    )
    .context("invalid counter opts")
  };
  let histogram = |name: &str, help: &str| {
    Histogram::with_opts(HistogramOpts::new(
      format!("doco_cd_{name}"),
      help,
    ))
    .context("invalid histogram opts")
  };

  let polls_total =
    counter("polls_total", "Poll runs per repository")?;
  let poll_errors_total =
    counter("poll_errors_total", "Failed poll runs per repository")?;
  let webhook_requests_total = counter(
    "webhook_requests_total",
    "Webhook requests per repository",
  )?;
  let webhook_errors_total = counter(
    "webhook_errors_total",
    "Failed webhook requests per repository",
  )?;
  let deployments_total =
    counter("deployments_total", "Deployments per repository")?;
  let deployment_errors_total = counter(
    "deployment_errors_total",
    "Failed deployments per repository",
  )?;
  let poll_duration = histogram(
    "poll_duration_seconds",
    "Duration of poll reconciliations",
  )?;
  let webhook_duration = histogram(
    "webhook_duration_seconds",
    "Duration of webhook reconciliations",
  )?;
  let deployment_duration = histogram(
    "deployment_duration_seconds",
    "Duration of single stack deployments",
  )?;
  let info = IntGaugeVec::new(
    Opts::new("doco_cd_info", "Build and runtime information"),
    &["version", "log_level", "start_time"],
  )
  .context("invalid gauge opts")?;

  for collector in [
    &polls_total,
    &poll_errors_total,
    &webhook_requests_total,
    &webhook_errors_total,
    &deployments_total,
    &deployment_errors_total,
  ] {
    registry
      .register(Box::new(collector.clone()))
      .context("failed to register counter")?;
  }
  for collector in
    [&poll_duration, &webhook_duration, &deployment_duration]
  {
    registry
      .register(Box::new(collector.clone()))
      .context("failed to register histogram")?;
  }
  registry
    .register(Box::new(info.clone()))
    .context("failed to register info gauge")?;

  Ok(Metrics {
    registry,
    polls_total,
    poll_errors_total,
    webhook_requests_total,
    webhook_errors_total,
    deployments_total,
    deployment_errors_total,
    poll_duration,
    webhook_duration,
    deployment_duration,
    info,
  })
}

/// Stamp the info gauge once at startup.
pub fn init_info() {
  let start_time =
    (command::doco_timestamp() / 1000).to_string();
  metrics()
    .info
    .with_label_values(&[
      env!("CARGO_PKG_VERSION"),
      &core_config().logging.level.to_string(),
      &start_time,
    ])
    .set(1);
}

/// Prometheus text exposition for GET /metrics.
pub async fn handler() -> axum::response::Response {
  let encoder = TextEncoder::new();
  match encoder.encode_to_string(&metrics().registry.gather()) {
    Ok(body) => axum::response::Response::builder()
      .header(
        axum::http::header::CONTENT_TYPE,
        encoder.format_type(),
      )
      .body(axum::body::Body::from(body))
      .expect("metrics response"),
    Err(e) => {
      error!("failed to encode metrics | {e:?}");
      axum::response::Response::builder()
        .status(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
        .body(axum::body::Body::empty())
        .expect("metrics error response")
    }
  }
}
