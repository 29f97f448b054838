//! A minimal SMTP server handing every transaction to a [`Session`].

use crate::command::Command;
use crate::config::Config;
use crate::session::{Backend, Session, SessionState};
use crate::utils::{decode_base64_line, decode_plain_credentials};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Longest line read in one go. Longer DATA lines are read in pieces,
/// longer command lines close the connection.
const MAX_LINE_LENGTH: u64 = 64 * 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const SHUTTING_DOWN_421: &str = "421 4.3.2 Service shutting down, closing transmission channel";

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Applied to every single read and write.
    pub io_timeout: Duration,
    pub max_message_size: usize,
    /// How many `RCPT TO` one transaction may carry. Only the last one is used.
    pub max_recipients: usize,
}

impl Limits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            io_timeout: config.io_timeout(),
            max_message_size: config.max_message_size,
            max_recipients: config.max_recipients,
        }
    }
}

/// The SMTP side of anyslk.
#[derive(Debug)]
pub struct SmtpServer {
    backend: Arc<Backend>,
    domain: String,
    limits: Limits,
}

impl SmtpServer {
    pub fn new(backend: Arc<Backend>, domain: impl Into<String>, limits: Limits) -> Self {
        Self {
            backend,
            domain: domain.into(),
            limits,
        }
    }

    /// Accepts connections until `shutdown` is cancelled.
    ///
    /// Every connection runs in its own task registered with `tracker`, so
    /// the caller can wait for them to finish.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) {
        match listener.local_addr() {
            Ok(addr) => log::info!("Start listening {addr}"),
            Err(e) => log::warn!("Start listening on unknown address: {e}"),
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    log::debug!("New connection from {peer}");
                    let server = self.clone();
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        if let Err(e) = server.handle_connection(socket, shutdown).await {
                            log::warn!("Error handling connection from {peer}: {e}");
                        }
                    });
                }
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        log::info!("Stopped accepting connections");
    }

    /// Handles an individual SMTP connection.
    async fn handle_connection(
        self: Arc<Self>,
        socket: TcpStream,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        let (reader, writer) = socket.into_split();
        let mut conn = Connection {
            reader: BufReader::new(reader),
            writer,
            io_timeout: self.limits.io_timeout,
            shutdown,
        };

        conn.reply(&format!("220 {} ESMTP anyslk", self.domain))
            .await?;

        let mut session: Option<Session> = None;
        let mut recipients = 0usize;

        'connection: loop {
            let line = match conn.read_line().await? {
                Input::Line(line) => line,
                Input::Closed => break 'connection,
                Input::Shutdown => {
                    conn.reply(SHUTTING_DOWN_421).await?;
                    break 'connection;
                }
            };

            if !line.ends_with(b"\n") {
                if line.len() as u64 >= MAX_LINE_LENGTH {
                    conn.reply("500 5.5.2 Line too long").await?;
                }
                break 'connection;
            }

            let line = String::from_utf8_lossy(&line);
            let cmd = line.trim_end_matches(['\r', '\n']);
            log::debug!("Received: {cmd}");

            match Command::parse(cmd) {
                Command::Helo => {
                    reset_transaction(&mut session, &mut recipients);
                    conn.reply(&format!("250 {}", self.domain)).await?;
                }
                Command::Ehlo => {
                    reset_transaction(&mut session, &mut recipients);
                    conn.reply(&format!(
                        "250-{}\r\n250-SIZE {}\r\n250-8BITMIME\r\n250 AUTH PLAIN LOGIN ANONYMOUS",
                        self.domain, self.limits.max_message_size
                    ))
                    .await?;
                }
                Command::Auth {
                    mechanism,
                    initial_response,
                } => {
                    if session.is_some() {
                        conn.reply("503 5.5.1 Already authenticated").await?;
                        continue 'connection;
                    }
                    match authenticate(&mut conn, &mechanism, initial_response).await? {
                        Auth::Login { username, password } => {
                            let new_session = self.backend.login(&username, &password);
                            log::debug!("Authenticated as {}", new_session.identity());
                            session = Some(new_session);
                            conn.reply("235 2.7.0 Authentication succeeded").await?;
                        }
                        Auth::Anonymous => {
                            session = Some(self.backend.anonymous_login());
                            conn.reply("235 2.7.0 Authentication succeeded").await?;
                        }
                        Auth::Rejected(reply) => conn.reply(reply).await?,
                        Auth::Disconnected => break 'connection,
                    }
                }
                Command::Mail(None) => {
                    conn.reply("501 5.5.4 Syntax: MAIL FROM:<address>").await?;
                }
                Command::Mail(Some(from)) => {
                    let session = session.get_or_insert_with(|| self.backend.anonymous_login());
                    recipients = 0;
                    match session.mail(&from) {
                        Ok(()) => conn.reply("250 2.1.0 Sender OK").await?,
                        Err(e) => conn.reply(&format!("503 5.5.1 {e}")).await?,
                    }
                }
                Command::Rcpt(None) => {
                    conn.reply("501 5.5.4 Syntax: RCPT TO:<address>").await?;
                }
                Command::Rcpt(Some(to)) => {
                    let Some(session) = session.as_mut().filter(|s| {
                        matches!(s.state(), SessionState::HasFrom | SessionState::HasRecipient)
                    }) else {
                        conn.reply("503 5.5.1 Bad sequence of commands: MAIL FROM required")
                            .await?;
                        continue 'connection;
                    };
                    if recipients >= self.limits.max_recipients {
                        conn.reply(&format!(
                            "452 4.5.3 Maximum limit of {} recipients reached",
                            self.limits.max_recipients
                        ))
                        .await?;
                        continue 'connection;
                    }
                    match session.rcpt(&to) {
                        Ok(()) => {
                            recipients += 1;
                            conn.reply("250 2.1.5 Recipient OK").await?;
                        }
                        Err(e) => conn.reply(&format!("503 5.5.1 {e}")).await?,
                    }
                }
                Command::Data => {
                    let Some(session) = session
                        .as_mut()
                        .filter(|s| s.state() == SessionState::HasRecipient)
                    else {
                        conn.reply("503 5.5.1 Bad sequence of commands: RCPT TO required")
                            .await?;
                        continue 'connection;
                    };

                    log::debug!(
                        "Receiving message from {} to {}",
                        session.envelope().from,
                        session.envelope().to
                    );
                    conn.reply("354 End data with <CR><LF>.<CR><LF>").await?;
                    let body = match conn.read_data(self.limits.max_message_size).await? {
                        Data::Complete(body) => body,
                        Data::TooLarge => {
                            session.reset();
                            recipients = 0;
                            conn.reply("552 5.3.4 Maximum message size exceeded").await?;
                            continue 'connection;
                        }
                        Data::Closed => break 'connection,
                        Data::Shutdown => {
                            conn.reply(SHUTTING_DOWN_421).await?;
                            break 'connection;
                        }
                    };

                    let response = match session.data(body.as_slice()).await {
                        Ok(()) => "250 2.0.0 OK: queued".to_string(),
                        Err(e) => {
                            log::warn!("DATA failed: {e}");
                            format!("554 5.3.0 Transaction failed: {e}")
                        }
                    };
                    session.reset();
                    recipients = 0;
                    conn.reply(&response).await?;
                }
                Command::Rset => {
                    reset_transaction(&mut session, &mut recipients);
                    conn.reply("250 2.0.0 OK").await?;
                }
                Command::Noop => {
                    conn.reply("250 2.0.0 OK").await?;
                }
                Command::Quit => {
                    if let Some(session) = session.as_mut() {
                        session.logout();
                    }
                    conn.reply("221 2.0.0 Bye").await?;
                    break 'connection;
                }
                Command::Unknown => {
                    conn.reply("500 5.5.2 Command not recognized").await?;
                }
            }
        }

        Ok(())
    }
}

fn reset_transaction(session: &mut Option<Session>, recipients: &mut usize) {
    if let Some(session) = session.as_mut() {
        session.reset();
    }
    *recipients = 0;
}

enum Auth {
    Login { username: String, password: String },
    Anonymous,
    Rejected(&'static str),
    Disconnected,
}

impl Auth {
    /// Credentials without a username count as an anonymous login.
    fn login(username: String, password: String) -> Self {
        if username.is_empty() {
            Self::Anonymous
        } else {
            Self::Login { username, password }
        }
    }
}

/// Runs the `AUTH` exchange. Every well-formed answer is accepted.
async fn authenticate(
    conn: &mut Connection,
    mechanism: &str,
    initial_response: Option<String>,
) -> io::Result<Auth> {
    match mechanism {
        "PLAIN" => {
            let response = match initial_response {
                Some(response) => response,
                None => {
                    conn.reply("334 ").await?;
                    match conn.read_auth_line().await? {
                        Some(line) => line,
                        None => return Ok(Auth::Disconnected),
                    }
                }
            };
            if response == "*" {
                return Ok(Auth::Rejected("501 5.0.0 Authentication cancelled"));
            }
            Ok(match decode_plain_credentials(&response) {
                Some((username, password)) => Auth::login(username, password),
                None => Auth::Rejected("501 5.5.2 Invalid PLAIN credentials"),
            })
        }
        "LOGIN" => {
            let username = match initial_response {
                Some(response) => response,
                None => {
                    // "Username:"
                    conn.reply("334 VXNlcm5hbWU6").await?;
                    match conn.read_auth_line().await? {
                        Some(line) => line,
                        None => return Ok(Auth::Disconnected),
                    }
                }
            };
            // "Password:"
            conn.reply("334 UGFzc3dvcmQ6").await?;
            let Some(password) = conn.read_auth_line().await? else {
                return Ok(Auth::Disconnected);
            };
            match (decode_base64_line(&username), decode_base64_line(&password)) {
                (Some(username), Some(password)) => Ok(Auth::login(username, password)),
                _ => Ok(Auth::Rejected("501 5.5.2 Invalid LOGIN credentials")),
            }
        }
        "ANONYMOUS" => {
            if initial_response.is_none() {
                conn.reply("334 ").await?;
                // The trace information is only logged.
                match conn.read_auth_line().await? {
                    Some(trace) => log::debug!("Anonymous login trace: {trace}"),
                    None => return Ok(Auth::Disconnected),
                }
            }
            Ok(Auth::Anonymous)
        }
        // bare `AUTH`
        "" => Ok(Auth::Anonymous),
        _ => Ok(Auth::Rejected("504 5.5.4 Unrecognized authentication type")),
    }
}

enum Input {
    /// Bytes up to and including `\n`, or a partial line when the line is
    /// too long or the peer closed mid-line.
    Line(Vec<u8>),
    Closed,
    Shutdown,
}

enum Data {
    Complete(Vec<u8>),
    TooLarge,
    Closed,
    Shutdown,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    io_timeout: Duration,
    shutdown: CancellationToken,
}

impl Connection {
    async fn read_line(&mut self) -> io::Result<Input> {
        let mut line = Vec::new();
        let read = {
            let mut limited = (&mut self.reader).take(MAX_LINE_LENGTH);
            tokio::select! {
                _ = self.shutdown.cancelled() => None,
                read = timeout(self.io_timeout, limited.read_until(b'\n', &mut line)) => Some(read),
            }
        };

        match read {
            None => Ok(Input::Shutdown),
            Some(Err(_)) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
            Some(Ok(Err(e))) => Err(e),
            Some(Ok(Ok(0))) => Ok(Input::Closed),
            Some(Ok(Ok(_))) => Ok(Input::Line(line)),
        }
    }

    /// Reads one line of an `AUTH` exchange, `None` if the client went away.
    async fn read_auth_line(&mut self) -> io::Result<Option<String>> {
        match self.read_line().await? {
            Input::Line(line) if line.ends_with(b"\n") => {
                let line = String::from_utf8_lossy(&line);
                Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
            }
            Input::Shutdown => {
                self.reply(SHUTTING_DOWN_421).await?;
                Ok(None)
            }
            Input::Line(_) | Input::Closed => Ok(None),
        }
    }

    /// Reads the message up to the terminating `.` line, undoing dot-stuffing.
    ///
    /// An oversized message is still read to its end, so the connection
    /// stays usable for the next transaction.
    async fn read_data(&mut self, max_size: usize) -> io::Result<Data> {
        let mut body = Vec::new();
        let mut too_large = false;
        let mut at_line_start = true;

        loop {
            let chunk = match self.read_line().await? {
                Input::Line(chunk) => chunk,
                Input::Closed => return Ok(Data::Closed),
                Input::Shutdown => return Ok(Data::Shutdown),
            };

            if at_line_start && (chunk == b".\r\n" || chunk == b".\n") {
                break;
            }

            let content: &[u8] = if at_line_start {
                chunk.strip_prefix(b".").unwrap_or(&chunk)
            } else {
                &chunk
            };
            at_line_start = chunk.ends_with(b"\n");

            if too_large {
                continue;
            }
            if body.len() + content.len() > max_size {
                log::debug!("Message exceeds {max_size} bytes, discarding");
                too_large = true;
                body = Vec::new();
            } else {
                body.extend_from_slice(content);
            }
        }

        Ok(if too_large {
            Data::TooLarge
        } else {
            Data::Complete(body)
        })
    }

    async fn reply(&mut self, response: &str) -> io::Result<()> {
        log::debug!("Sent: {response}");
        let writer = &mut self.writer;
        let write = async move {
            writer.write_all(response.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            writer.flush().await
        };
        timeout(self.io_timeout, write)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BodyMode;
    use crate::notifier::tests::RecordingNotifier;
    use crate::smtp_client::Client;
    use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
    use rstest::*;
    use std::net::SocketAddr;
    use testresult::TestResult;

    struct TestServer {
        addr: SocketAddr,
        notifier: Arc<RecordingNotifier>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
        serving: tokio::task::JoinHandle<()>,
    }

    async fn start_server_with(notifier: RecordingNotifier, limits: Limits) -> TestResult<TestServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let notifier = Arc::new(notifier);
        let backend = Arc::new(Backend::new(notifier.clone(), "box1", BodyMode::Parsed));
        let server = Arc::new(SmtpServer::new(backend, "anyslk.local", limits));
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let serving = tokio::spawn(server.serve(listener, shutdown.clone(), tracker.clone()));
        Ok(TestServer {
            addr,
            notifier,
            shutdown,
            tracker,
            serving,
        })
    }

    async fn start_server() -> TestResult<TestServer> {
        start_server_with(RecordingNotifier::default(), Limits::from_config(&Config::default())).await
    }

    #[tokio::test]
    async fn test_end_to_end() -> TestResult {
        let server = start_server().await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("EHLO client.test", "250").await?;
        client.cmd("MAIL FROM:<a@test>", "250").await?;
        client.cmd("RCPT TO:<ops@test>", "250").await?;
        client.cmd("DATA", "354").await?;
        client.cmd("Subject: hi\r\n\r\nbody\r\n.", "250").await?;
        client.cmd("QUIT", "221").await?;

        let sent = server.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "#ops");
        assert_eq!(sent[0].username, "anyslk");
        assert_eq!(sent[0].title(), Some(":email: hi"));
        let from = &sent[0].attachments[0].fields[0];
        assert_eq!(from.title, "From");
        assert_eq!(from.value, "a@test");
        Ok(())
    }

    #[tokio::test]
    async fn test_last_recipient_decides_channel() -> TestResult {
        let server = start_server().await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("HELO client.test", "250").await?;
        client.cmd("MAIL FROM:<cron@host>", "250").await?;
        client.cmd("RCPT TO:<a@x>", "250").await?;
        client.cmd("RCPT TO:<b@y>", "250").await?;
        client.cmd("DATA", "354").await?;
        client.cmd("Subject: s\r\n\r\nbody\r\n.", "250").await?;

        let sent = server.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "#b");
        Ok(())
    }

    #[tokio::test]
    async fn test_session_is_reused_for_next_transaction() -> TestResult {
        let server = start_server().await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("EHLO client.test", "250").await?;
        for channel in ["first", "second"] {
            client.cmd("MAIL FROM:<cron@host>", "250").await?;
            client.cmd(&format!("RCPT TO:<{channel}@test>"), "250").await?;
            client.cmd("DATA", "354").await?;
            client.cmd("plain text\r\n.", "250").await?;
        }

        let channels: Vec<_> = server.notifier.sent().into_iter().map(|p| p.channel).collect();
        assert_eq!(channels, ["#first", "#second"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_sequences() -> TestResult {
        let server = start_server().await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("EHLO client.test", "250").await?;
        client.cmd("RCPT TO:<ops@test>", "503").await?;
        client.cmd("DATA", "503").await?;
        client.cmd("MAIL FROM:<a@test>", "250").await?;
        client.cmd("DATA", "503").await?;
        client.cmd("MAIL FROM", "501").await?;
        client.cmd("RCPT TO:", "501").await?;
        client.cmd("VRFY ops", "500").await?;
        client.cmd("NOOP", "250").await?;
        assert!(server.notifier.sent().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_rset_discards_transaction() -> TestResult {
        let server = start_server().await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("EHLO client.test", "250").await?;
        client.cmd("MAIL FROM:<a@test>", "250").await?;
        client.cmd("RCPT TO:<ops@test>", "250").await?;
        client.cmd("RSET", "250").await?;
        client.cmd("DATA", "503").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_recipient_limit() -> TestResult {
        let limits = Limits {
            max_recipients: 2,
            ..Limits::from_config(&Config::default())
        };
        let server = start_server_with(RecordingNotifier::default(), limits).await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("EHLO client.test", "250").await?;
        client.cmd("MAIL FROM:<a@test>", "250").await?;
        client.cmd("RCPT TO:<one@test>", "250").await?;
        client.cmd("RCPT TO:<two@test>", "250").await?;
        client.cmd("RCPT TO:<three@test>", "452").await?;
        client.cmd("DATA", "354").await?;
        client.cmd("x\r\n.", "250").await?;

        // the rejected recipient did not replace the accepted one
        assert_eq!(server.notifier.sent()[0].channel, "#two");
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() -> TestResult {
        let limits = Limits {
            max_message_size: 16,
            ..Limits::from_config(&Config::default())
        };
        let server = start_server_with(RecordingNotifier::default(), limits).await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("EHLO client.test", "250").await?;
        client.cmd("MAIL FROM:<a@test>", "250").await?;
        client.cmd("RCPT TO:<ops@test>", "250").await?;
        client.cmd("DATA", "354").await?;
        client.cmd("this line is longer than sixteen bytes\r\n.", "552").await?;
        // the connection is still usable
        client.cmd("NOOP", "250").await?;
        client.cmd("DATA", "503").await?;
        assert!(server.notifier.sent().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_dot_unstuffing() -> TestResult {
        let server = start_server().await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("HELO client.test", "250").await?;
        client.cmd("MAIL FROM:<a@test>", "250").await?;
        client.cmd("RCPT TO:<ops>", "250").await?;
        client.cmd("DATA", "354").await?;
        client.cmd("..hidden\r\nline\r\n.", "250").await?;

        let sent = server.notifier.sent();
        assert_eq!(sent[0].channel, "#ops");
        assert_eq!(sent[0].attachments[0].text.as_deref(), Some(".hidden\r\nline\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn test_delivery_failure_still_accepts_mail() -> TestResult {
        let server =
            start_server_with(RecordingNotifier::failing(), Limits::from_config(&Config::default()))
                .await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("HELO client.test", "250").await?;
        client.cmd("MAIL FROM:<a@test>", "250").await?;
        client.cmd("RCPT TO:<ops@test>", "250").await?;
        client.cmd("DATA", "354").await?;
        client.cmd("Subject: hi\r\n\r\nbody\r\n.", "250").await?;
        assert_eq!(server.notifier.sent().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_auth_plain_sets_username() -> TestResult {
        let server = start_server().await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("EHLO client.test", "250").await?;
        // "\0alice\0secret"
        client.cmd("AUTH PLAIN AGFsaWNlAHNlY3JldA==", "235").await?;
        client.cmd("AUTH PLAIN AGFsaWNlAHNlY3JldA==", "503").await?;
        client.cmd("MAIL FROM:<a@test>", "250").await?;
        client.cmd("RCPT TO:<ops@test>", "250").await?;
        client.cmd("DATA", "354").await?;
        client.cmd("Subject: hi\r\n\r\n.", "250").await?;
        assert_eq!(server.notifier.sent()[0].username, "alice");
        Ok(())
    }

    #[tokio::test]
    async fn test_auth_login_sets_username() -> TestResult {
        let server = start_server().await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("EHLO client.test", "250").await?;
        client.cmd("AUTH LOGIN", "334").await?;
        // "bob"
        client.cmd("Ym9i", "334").await?;
        // "anything"
        client.cmd("YW55dGhpbmc=", "235").await?;
        client.cmd("MAIL FROM:<a@test>", "250").await?;
        client.cmd("RCPT TO:<ops@test>", "250").await?;
        client.cmd("DATA", "354").await?;
        client.cmd("x\r\n.", "250").await?;
        assert_eq!(server.notifier.sent()[0].username, "bob");
        Ok(())
    }

    #[tokio::test]
    async fn test_auth_anonymous_and_unknown_mechanism() -> TestResult {
        let server = start_server().await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("EHLO client.test", "250").await?;
        client.cmd("AUTH CRAM-MD5", "504").await?;
        client.cmd("AUTH PLAIN", "334").await?;
        client.cmd("*", "501").await?;
        client.cmd("AUTH ANONYMOUS", "334").await?;
        client.cmd("trace", "235").await?;
        client.cmd("MAIL FROM:<a@test>", "250").await?;
        client.cmd("RCPT TO:<ops@test>", "250").await?;
        client.cmd("DATA", "354").await?;
        client.cmd("x\r\n.", "250").await?;
        assert_eq!(server.notifier.sent()[0].username, "anyslk");
        Ok(())
    }

    #[rstest]
    // "\0\0"
    #[case::plain_empty(&[("AUTH PLAIN AAA=", "235")])]
    // "\0\0secret"
    #[case::plain_no_username(&[("AUTH PLAIN AABzZWNyZXQ=", "235")])]
    #[case::login_empty(&[("AUTH LOGIN", "334"), ("", "334"), ("", "235")])]
    #[case::bare(&[("AUTH", "235")])]
    #[tokio::test]
    async fn test_auth_without_username_is_anonymous(#[case] exchange: &[(&str, &str)]) -> TestResult {
        let server = start_server().await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("EHLO client.test", "250").await?;
        for (line, code) in exchange {
            client.cmd(line, code).await?;
        }
        client.cmd("MAIL FROM:<a@test>", "250").await?;
        client.cmd("RCPT TO:<ops@test>", "250").await?;
        client.cmd("DATA", "354").await?;
        client.cmd("x\r\n.", "250").await?;
        assert_eq!(server.notifier.sent()[0].username, "anyslk");
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connections() -> TestResult {
        let server = start_server().await?;
        let mut client = Client::connect(server.addr).await?;
        client.cmd("EHLO client.test", "250").await?;

        server.shutdown.cancel();
        client.expect("421").await?;

        timeout(Duration::from_secs(5), server.serving).await??;
        server.tracker.close();
        timeout(Duration::from_secs(5), server.tracker.wait()).await?;
        // the listening socket is gone
        assert!(TcpStream::connect(server.addr).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_lettre_client() -> TestResult {
        let server = start_server().await?;
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("127.0.0.1")
            .port(server.addr.port())
            .build();
        let envelope = lettre::address::Envelope::new(
            Some("cron@backup.example.org".parse()?),
            vec!["ops@example.org".parse()?],
        )?;
        let raw = std::fs::read("test_data/plain.eml")?;
        mailer.send_raw(&envelope, &raw).await?;

        let sent = server.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "#ops");
        assert_eq!(
            sent[0].title(),
            Some(":email: Cron <root@backup> /usr/local/bin/nightly-backup")
        );
        assert_eq!(
            sent[0].attachments[0].fields[3].value.trim(),
            "backup finished with 2 warnings"
        );
        Ok(())
    }
}
