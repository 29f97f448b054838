//! Per-connection mail session.
//!
//! A [`Session`] is created by the [`Backend`] when a client logs in (or
//! starts a transaction anonymously) and collects the envelope of one
//! transaction at a time. Completing `DATA` turns the transaction into a
//! notification.

use crate::message::{BodyMode, ParsedMessage};
use crate::notifier::{NotificationPayload, Notifier, unix_now};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Identity of sessions that did not authenticate.
pub const ANONYMOUS_IDENTITY: &str = "anyslk";

/// Sender, recipient and raw message data of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    /// Only the last `RCPT TO` of a transaction is kept.
    pub to: String,
    pub raw_body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    HasFrom,
    HasRecipient,
    Complete,
    LoggedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is logged out")]
    LoggedOut,
    #[error("failed to read message body: {0}")]
    Body(#[from] std::io::Error),
}

/// State shared by every session for the lifetime of the service.
pub struct Backend {
    notifier: Arc<dyn Notifier>,
    hostname: String,
    body_mode: BodyMode,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("hostname", &self.hostname)
            .field("body_mode", &self.body_mode)
            .finish_non_exhaustive()
    }
}

impl Backend {
    pub fn new(notifier: Arc<dyn Notifier>, hostname: impl Into<String>, body_mode: BodyMode) -> Self {
        Self {
            notifier,
            hostname: hostname.into(),
            body_mode,
        }
    }

    /// Name of this machine as shown in notification footers.
    pub fn local_hostname() -> String {
        match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                log::warn!("Failed to get hostname: {e}");
                "localhost".to_string()
            }
        }
    }

    /// Handles a login with username and password. Any credentials are accepted.
    pub fn login(self: &Arc<Self>, username: &str, _password: &str) -> Session {
        log::debug!("Login as {username}");
        Session::new(self.clone(), username)
    }

    /// Handles a client that never authenticated.
    pub fn anonymous_login(self: &Arc<Self>) -> Session {
        Session::new(self.clone(), ANONYMOUS_IDENTITY)
    }
}

/// Mail session of one client connection.
#[derive(Debug)]
pub struct Session {
    backend: Arc<Backend>,
    identity: String,
    envelope: Envelope,
    state: SessionState,
}

impl Session {
    fn new(backend: Arc<Backend>, identity: &str) -> Self {
        Self {
            backend,
            identity: identity.to_string(),
            envelope: Envelope::default(),
            state: SessionState::Init,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Sets the sender, overwriting any previous one. The address is not validated.
    pub fn mail(&mut self, from: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.envelope.from = from.to_string();
        self.state = SessionState::HasFrom;
        Ok(())
    }

    /// Sets the recipient. A later call replaces the earlier recipient.
    pub fn rcpt(&mut self, to: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.envelope.to.is_empty() {
            log::debug!("Recipient {} replaced by {to}", self.envelope.to);
        }
        self.envelope.to = to.to_string();
        self.state = SessionState::HasRecipient;
        Ok(())
    }

    /// Reads the message body and posts the notification.
    ///
    /// Works without a recipient as well, the notification then goes to `#`.
    /// A failing `body` aborts the transaction before anything is sent.
    /// Webhook failures are logged and never returned.
    pub async fn data<R>(&mut self, mut body: R) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_open()?;

        let mut raw_body = Vec::new();
        body.read_to_end(&mut raw_body).await?;
        self.envelope.raw_body = raw_body;

        let message = ParsedMessage::parse(&self.envelope.raw_body, self.backend.body_mode);
        let payload = NotificationPayload::build(
            &self.envelope,
            &message,
            &self.identity,
            &self.backend.hostname,
            unix_now(),
        );

        let delivery = self.backend.notifier.notify(&payload).await;
        let headers = message.headers.as_deref().unwrap_or_default();
        match delivery {
            Ok(()) => log::info!(
                target: "anyslk::audit",
                "Mail -> slack message delivered: from={:?} to={:?} channel={} title={:?} header={:?} body={:?}",
                self.envelope.from,
                self.envelope.to,
                payload.channel,
                payload.title().unwrap_or_default(),
                headers,
                message.body_text,
            ),
            Err(e) => log::error!(
                target: "anyslk::audit",
                "Mail -> slack message failed: from={:?} to={:?} channel={} title={:?} header={:?} body={:?} error={e}",
                self.envelope.from,
                self.envelope.to,
                payload.channel,
                payload.title().unwrap_or_default(),
                headers,
                message.body_text,
            ),
        }

        self.state = SessionState::Complete;
        Ok(())
    }

    /// Discards the current transaction, keeping the identity.
    pub fn reset(&mut self) {
        if self.state == SessionState::LoggedOut {
            return;
        }
        self.envelope = Envelope::default();
        self.state = SessionState::Init;
    }

    /// Ends the session. Every later command fails.
    pub fn logout(&mut self) {
        self.envelope = Envelope::default();
        self.state = SessionState::LoggedOut;
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state == SessionState::LoggedOut {
            return Err(SessionError::LoggedOut);
        }
        Ok(())
    }
}
