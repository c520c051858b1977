use anyhow::{Context, anyhow};

use super::{Notification, http_client, standard_content};

#[instrument(level = "debug", skip(notification))]
pub async fn send_alert(
  url: &str,
  notification: &Notification,
) -> anyhow::Result<()> {
  let content = standard_content(notification);
  let response = http_client()
    .post(url)
    .header("Title", notification.title.clone())
    .body(content)
    .send()
    .await
    .context("Failed to send message")?;

  let status = response.status();
  if status.is_success() {
    debug!("ntfy alert sent successfully: {status}");
    Ok(())
  } else {
    let text = response.text().await.with_context(|| {
      format!(
        "Failed to send message to ntfy | {status} | failed to get response text"
      )
    })?;
    Err(anyhow!(
      "Failed to send message to ntfy | {status} | {text}"
    ))
  }
}
