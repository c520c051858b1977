use std::{sync::OnceLock, time::Duration};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::core_config;

mod ntfy;
mod pushover;
mod webhook;

#[derive(
  Debug, Clone, Copy, Serialize, strum::Display, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AlertLevel {
  Ok,
  Error,
}

/// One job outcome, published to the configured notification
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
  pub level: AlertLevel,
  pub title: String,
  pub repository: String,
  pub stack: String,
  /// `<ref>@<short-sha>`
  pub revision: String,
  pub job_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

/// Plain-text rendering shared by the text-based senders.
fn standard_content(notification: &Notification) -> String {
  let level = match notification.level {
    AlertLevel::Ok => "OK",
    AlertLevel::Error => "ERROR",
  };
  let detail = notification
    .message
    .as_ref()
    .map(|message| format!("\n{message}"))
    .unwrap_or_default();
  format!(
    "{level} | {} | {} | {} | {} | job {}{detail}",
    notification.title,
    notification.repository,
    notification.stack,
    notification.revision,
    notification.job_id,
  )
}

enum Message {
  Notify(Box<Notification>),
  Flush(oneshot::Sender<()>),
}

fn sender() -> &'static mpsc::UnboundedSender<Message> {
  static SENDER: OnceLock<mpsc::UnboundedSender<Message>> =
    OnceLock::new();
  SENDER.get_or_init(|| {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(sender_loop(rx));
    tx
  })
}

/// Fire and forget. The job path never blocks on notifications.
pub fn notify(notification: Notification) {
  if sender()
    .send(Message::Notify(Box::new(notification)))
    .is_err()
  {
    warn!("notification channel closed, alert dropped");
  }
}

/// Waits until every queued notification went out.
/// Called once on shutdown.
pub async fn flush() {
  let (tx, rx) = oneshot::channel();
  if sender().send(Message::Flush(tx)).is_ok() {
    let _ = tokio::time::timeout(Duration::from_secs(10), rx).await;
  }
}

async fn sender_loop(mut rx: mpsc::UnboundedReceiver<Message>) {
  while let Some(message) = rx.recv().await {
    match message {
      Message::Notify(notification) => {
        let Some(url) = &core_config().notification_url else {
          continue;
        };
        let res = match core_config()
          .notification_provider
          .as_str()
        {
          "ntfy" => ntfy::send_alert(url, &notification).await,
          "pushover" => {
            pushover::send_alert(url, &notification).await
          }
          _ => webhook::send_alert(url, &notification).await,
        };
        if let Err(e) = res {
          warn!(
            "failed to notify for {} {} | {e:#}",
            notification.repository, notification.stack,
          );
        }
      }
      Message::Flush(ack) => {
        let _ = ack.send(());
      }
    }
  }
}

fn http_client() -> &'static reqwest::Client {
  static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
  CLIENT.get_or_init(|| {
    reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()
      .expect("failed to build notification http client")
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn standard_content_carries_job_metadata() {
    let content = standard_content(&Notification {
      level: AlertLevel::Error,
      title: String::from("Deployment failed"),
      repository: String::from("acme/app"),
      stack: String::from("web"),
      revision: String::from("refs/heads/main@abc1234"),
      job_id: String::from("68ab12cd34ef56ab78cd90ef"),
      message: Some(String::from("compose up failed")),
    });
    assert!(content.starts_with("ERROR | Deployment failed"));
    assert!(content.contains("acme/app"));
    assert!(content.contains("refs/heads/main@abc1234"));
    assert!(content.ends_with("compose up failed"));
  }
}
