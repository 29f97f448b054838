//! Slack notification payloads and their delivery to an incoming webhook.

use crate::message::ParsedMessage;
use crate::session::Envelope;
use async_trait::async_trait;
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const ICON_EMOJI: &str = ":slack:";
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Derive the channel from the local part of the recipient address.
///
/// `ops@example.org` maps to `#ops`, an address without `@` is used whole.
pub fn channel_for(to: &str) -> String {
    let local = to.split_once('@').map_or(to, |(local, _)| local);
    format!("#{local}")
}

/// Body of the webhook request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub channel: String,
    pub username: String,
    pub icon_emoji: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub title: String,
    pub fallback: String,
    pub ts: u64,
    pub footer: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub title: String,
    pub value: String,
    pub short: bool,
}

impl Field {
    fn new(title: &str, value: impl Into<String>, short: bool) -> Self {
        Self {
            title: title.to_string(),
            value: value.into(),
            short,
        }
    }
}

impl NotificationPayload {
    /// Build the notification for one completed transaction.
    ///
    /// Structured messages get From/To/Date/Body fields, anything else is
    /// posted as a single text block.
    pub fn build(
        envelope: &Envelope,
        message: &ParsedMessage,
        username: &str,
        hostname: &str,
        ts: u64,
    ) -> Self {
        let mail_from = format!("Mail from {}", envelope.from);
        let subject = message.subject.as_deref().filter(|_| message.is_structured());
        let (title, fallback) = match subject {
            Some(subject) => (format!(":email: {subject}"), subject.to_string()),
            None => (mail_from.clone(), mail_from),
        };

        let mut attachment = Attachment {
            title,
            fallback,
            ts,
            footer: format!("anyslk on {hostname}"),
            fields: Vec::new(),
            text: None,
        };

        if message.is_structured() {
            let or_envelope = |header: &Option<String>, envelope_value: &str| {
                header.clone().unwrap_or_else(|| envelope_value.to_string())
            };
            attachment.fields = vec![
                Field::new("From", or_envelope(&message.header_from, &envelope.from), true),
                Field::new("To", or_envelope(&message.header_to, &envelope.to), true),
                Field::new("Date", message.header_date.clone().unwrap_or_default(), true),
                Field::new("Body", message.body_text.clone(), false),
            ];
        } else {
            attachment.text = Some(message.body_text.clone());
        }

        Self {
            channel: channel_for(&envelope.to),
            username: username.to_string(),
            icon_emoji: ICON_EMOJI.to_string(),
            attachments: vec![attachment],
        }
    }

    /// Title of the (single) attachment.
    pub fn title(&self) -> Option<&str> {
        self.attachments.first().map(|a| a.title.as_str())
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Webhook delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook answered {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Something that delivers notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `payload`. The outcome is only ever logged by callers.
    async fn notify(&self, payload: &NotificationPayload) -> Result<(), DeliveryError>;
}

/// Posts payloads as JSON to a Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    retries: u32,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, retries: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            retries,
        }
    }

    async fn post(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Status { status, body })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        let mut attempt = 0;
        loop {
            match self.post(payload).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    log::debug!(
                        "Webhook delivery to {} failed ({e}), retry {attempt}/{}",
                        payload.channel,
                        self.retries
                    );
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
