//! Acquiring the listening socket.

use crate::config::Config;
use crate::error::Error;
use async_trait::async_trait;
use listenfd::ListenFd;
use tokio::net::TcpListener;

/// Provides the socket the SMTP server accepts connections on.
#[async_trait]
pub trait ListenerSource: Send + Sync {
    async fn acquire(&self) -> Result<TcpListener, Error>;
}

/// Binds a fresh socket.
#[derive(Debug, Clone)]
pub struct BindListener {
    addr: String,
}

impl BindListener {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl ListenerSource for BindListener {
    async fn acquire(&self) -> Result<TcpListener, Error> {
        TcpListener::bind(&self.addr)
            .await
            .map_err(|e| Error::bind(&self.addr, e))
    }
}

/// Takes over the first socket passed by the process supervisor
/// (`LISTEN_FDS` socket activation).
#[derive(Debug, Default, Clone, Copy)]
pub struct InheritedListener;

#[async_trait]
impl ListenerSource for InheritedListener {
    async fn acquire(&self) -> Result<TcpListener, Error> {
        let mut fds = ListenFd::from_env();
        log::debug!("{} socket(s) inherited", fds.len());
        let listener = fds
            .take_tcp_listener(0)
            .map_err(|e| Error::bind("inherited socket", e))?
            .ok_or(Error::NoInheritedSocket)?;
        adopt(listener)
    }
}

/// Hands an already bound socket over to tokio.
fn adopt(listener: std::net::TcpListener) -> Result<TcpListener, Error> {
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::bind("inherited socket", e))?;
    TcpListener::from_std(listener).map_err(|e| Error::bind("inherited socket", e))
}

/// Picks the listener for `config`.
///
/// Port 0 means the SMTP server is disabled, which leaves nothing to run.
pub fn listener_source(config: &Config) -> Result<Box<dyn ListenerSource>, Error> {
    if config.use_inherited_socket {
        return Ok(Box::new(InheritedListener));
    }
    if config.smtp_port == 0 {
        return Err(Error::NoServer);
    }
    Ok(Box::new(BindListener::new(config.listen_addr())))
}
