//! Where the webhook URL comes from.

use crate::error::Error;

/// Environment variables holding the Slack incoming webhook URL, in lookup order.
pub const WEBHOOK_ENV_KEYS: [&str; 3] = [
    "SLACK_INCOMMING_WEBHOOK_URL",
    "SLACK_WEBHOOK_URL",
    "SLACK_URL",
];

/// Provides the webhook URL notifications are posted to.
pub trait CredentialSource: Send + Sync {
    fn webhook_url(&self) -> Result<String, Error>;
}

/// Reads the webhook URL from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn webhook_url(&self) -> Result<String, Error> {
        resolve_webhook_url(&WEBHOOK_ENV_KEYS, |key| std::env::var(key).ok())
    }
}

/// Returns the first non-empty value among `keys`.
pub fn resolve_webhook_url<F>(keys: &[&'static str], lookup: F) -> Result<String, Error>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .find_map(|key| lookup(key).filter(|url| !url.is_empty()))
        .ok_or_else(|| Error::MissingWebhookUrl {
            keys: keys.to_vec(),
        })
}
