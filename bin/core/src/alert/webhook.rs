use anyhow::{Context, anyhow};

use super::{Notification, http_client};

/// Default sink: the notification serialized as JSON, posted to
/// the configured url.
#[instrument(level = "debug", skip(notification))]
pub async fn send_alert(
  url: &str,
  notification: &Notification,
) -> anyhow::Result<()> {
  let response = http_client()
    .post(url)
    .json(notification)
    .send()
    .await
    .context("Failed to send notification")?;

  let status = response.status();
  if status.is_success() {
    debug!("webhook notification sent successfully: {status}");
    Ok(())
  } else {
    let text = response.text().await.unwrap_or_default();
    Err(anyhow!(
      "Notification endpoint returned {status} | {text}"
    ))
  }
}
