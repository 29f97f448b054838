//! Line based SMTP client used to drive the server in tests.

use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpSocket;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unexpected answer to {context}: {raw_smtp_answer:?}")]
    Unexpected {
        context: String,
        raw_smtp_answer: String,
    },
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Client {
    /// Connects and consumes the `220` greeting.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let socket = TcpSocket::new_v4()?;

        // Disable Nagle's algorithm.
        socket.set_nodelay(true)?;

        let stream = socket.connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        };
        client.expect("220").await?;
        Ok(client)
    }

    /// Sends `command` followed by CRLF and checks the reply code.
    ///
    /// Returns the full (possibly multi-line) reply.
    pub async fn cmd(&mut self, command: &str, expected_code: &str) -> Result<String, ClientError> {
        self.send(command).await?;
        self.read_reply(command, expected_code).await
    }

    /// Sends `command` followed by CRLF without waiting for a reply.
    pub async fn send(&mut self, command: &str) -> Result<(), ClientError> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads a reply without sending anything first.
    pub async fn expect(&mut self, expected_code: &str) -> Result<String, ClientError> {
        self.read_reply("nothing", expected_code).await
    }

    async fn read_reply(&mut self, context: &str, expected_code: &str) -> Result<String, ClientError> {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                break;
            }
            reply.push_str(&line);
            // "250-..." continues, "250 ..." ends the reply
            if line.as_bytes().get(3) != Some(&b'-') {
                break;
            }
        }

        if !reply.starts_with(expected_code) {
            return Err(ClientError::Unexpected {
                context: context.to_string(),
                raw_smtp_answer: reply,
            });
        }
        Ok(reply)
    }
}
