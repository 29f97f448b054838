//! Service startup and shutdown.

use crate::config::Config;
use crate::credentials::{CredentialSource, EnvCredentials};
use crate::error::Error;
use crate::listener::{ListenerSource, listener_source};
use crate::notifier::{Notifier, WebhookNotifier};
use crate::session::Backend;
use crate::smtp_server::{Limits, SmtpServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A running SMTP server.
#[derive(Debug)]
pub struct Service {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    serving: JoinHandle<()>,
}

impl Service {
    /// Resolves the webhook URL, then acquires the socket and starts serving.
    ///
    /// Without a webhook URL no socket is ever touched.
    pub async fn start(
        config: &Config,
        credentials: &dyn CredentialSource,
        listeners: &dyn ListenerSource,
    ) -> Result<Self, Error> {
        let webhook_url = credentials.webhook_url()?;
        let notifier = Arc::new(WebhookNotifier::new(webhook_url, config.webhook_retries));
        Self::start_with_notifier(config, notifier, listeners).await
    }

    pub(crate) async fn start_with_notifier(
        config: &Config,
        notifier: Arc<dyn Notifier>,
        listeners: &dyn ListenerSource,
    ) -> Result<Self, Error> {
        let listener = listeners.acquire().await?;
        let local_addr = listener.local_addr()?;

        let backend = Arc::new(Backend::new(
            notifier,
            Backend::local_hostname(),
            config.body_mode,
        ));
        let server = Arc::new(SmtpServer::new(
            backend,
            config.domain.clone(),
            Limits::from_config(config),
        ));

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let serving = tokio::spawn(server.serve(listener, shutdown.clone(), tracker.clone()));

        Ok(Self {
            local_addr,
            shutdown,
            tracker,
            serving,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes the listening socket and waits up to
    /// `drain_timeout` for open connections to finish.
    ///
    /// Idle connections are told to go away, a transaction that is already
    /// posting its notification is allowed to finish.
    pub async fn shutdown(self, drain_timeout: Duration) {
        self.shutdown.cancel();
        if let Err(e) = self.serving.await {
            log::error!("SMTP server task failed: {e}");
        }

        self.tracker.close();
        if tokio::time::timeout(drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            log::warn!(
                "{} connection(s) still open after {drain_timeout:?}, exiting anyway",
                self.tracker.len()
            );
        }
    }
}

/// Runs anyslk until a termination signal arrives.
pub async fn run(config: &Config) -> Result<(), Error> {
    let mut signals = ShutdownSignals::new()?;

    log::info!("Starting SMTP server.");
    let listeners = listener_source(config)?;
    let service = Service::start(config, &EnvCredentials, listeners.as_ref()).await?;
    log::debug!("SMTP server is up on {}", service.local_addr());

    let signal = signals.recv().await;
    log::info!("Received {signal}. Shutting down servers.");
    service.shutdown(config.drain_timeout()).await;
    Ok(())
}

#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.quit.recv() => "SIGQUIT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
        }
        "Ctrl-C"
    }
}
