//! Error types.

/// Startup and configuration errors for anyslk.
///
/// Every variant is fatal: the process logs it and exits non-zero.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("anyslk config is invalid: {0}")]
    Config(#[from] serini::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Slack incoming webhook url environment variables are not found {keys:?}")]
    MissingWebhookUrl { keys: Vec<&'static str> },
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No socket was inherited from the process supervisor")]
    NoInheritedSocket,
    #[error("No server running: SMTP port is 0 and no inherited socket requested")]
    NoServer,
    #[error("Failed to initialise logging: {0}")]
    Logger(#[from] log::SetLoggerError),
}

impl Error {
    pub(crate) fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }
}
