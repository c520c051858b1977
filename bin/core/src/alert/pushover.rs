use anyhow::{Context, anyhow};

use super::{Notification, http_client, standard_content};

#[instrument(level = "debug", skip(notification))]
pub async fn send_alert(
  url: &str,
  notification: &Notification,
) -> anyhow::Result<()> {
  // pushover needs all information encoded in the URL: at minimum
  // the user key, the application token, and the url encoded
  // message. See https://pushover.net/api.
  let content = [("message", standard_content(notification))];

  let response = http_client()
    .post(url)
    .form(&content)
    .send()
    .await
    .context("Failed to send message")?;

  let status = response.status();
  if status.is_success() {
    debug!("pushover alert sent successfully: {status}");
    Ok(())
  } else {
    let text = response.text().await.with_context(|| {
      format!(
        "Failed to send message to pushover | {status} | failed to get response text"
      )
    })?;
    Err(anyhow!(
      "Failed to send message to pushover | {status} | {text}"
    ))
  }
}
