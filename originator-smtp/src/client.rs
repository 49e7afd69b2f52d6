//! SMTP connection: plain or TLS-wrapped stream, reply reader, command
//! writer, dot-stuffed DATA streaming.

use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{client::TlsStream, rustls::pki_types::ServerName, TlsConnector};
use tracing::trace;

use crate::reply::{Reply, ReplyParseError};

/// Initial reply buffer size.
const BUFFER_SIZE: usize = 8 * 1024;

/// Hard cap on a single reply; a peer exceeding this is broken.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Failures while reading or writing on the dialog stream.
#[derive(Debug, thiserror::Error)]
pub enum DialogIoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("reply exceeds {MAX_BUFFER_SIZE} bytes")]
    ReplyTooLarge,
    #[error("malformed reply: {0}")]
    Parse(#[from] ReplyParseError),
    #[error("operation timed out")]
    TimedOut,
}

enum StreamKind {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl StreamKind {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await,
            Self::Tls(stream) => stream.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await,
            Self::Tls(stream) => stream.flush().await,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
        }
    }
}

/// One SMTP dialog stream.
pub struct SmtpConnection {
    stream: StreamKind,
    buffer: Vec<u8>,
    filled: usize,
}

impl SmtpConnection {
    /// TCP-connect within `limit`.
    pub async fn connect(addr: SocketAddr, limit: Duration) -> Result<Self, DialogIoError> {
        let stream = timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| DialogIoError::TimedOut)??;
        Ok(Self {
            stream: StreamKind::Plain(stream),
            buffer: vec![0; BUFFER_SIZE],
            filled: 0,
        })
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.stream, StreamKind::Tls(_))
    }

    /// Wrap the plain stream in TLS (STARTTLS upgrade or implicit TLS).
    ///
    /// Any buffered cleartext is discarded; pipelining across a TLS
    /// boundary is forbidden anyway.
    pub async fn into_tls(
        self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<Self, DialogIoError> {
        match self.stream {
            StreamKind::Plain(stream) => {
                let tls = connector.connect(server_name, stream).await?;
                Ok(Self {
                    stream: StreamKind::Tls(Box::new(tls)),
                    buffer: self.buffer,
                    filled: 0,
                })
            }
            StreamKind::Tls(_) => Err(DialogIoError::Io(std::io::Error::other(
                "connection is already TLS",
            ))),
        }
    }

    /// Send one command line (CRLF appended) within `limit`.
    pub async fn send_line(&mut self, line: &str, limit: Duration) -> Result<(), DialogIoError> {
        trace!(line, "sending");
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        timeout(limit, async {
            self.stream.write_all(&data).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| DialogIoError::TimedOut)??;
        Ok(())
    }

    /// Read one complete reply within `limit`.
    pub async fn read_reply(&mut self, limit: Duration) -> Result<Reply, DialogIoError> {
        loop {
            if let Some((reply, consumed)) = Reply::parse(&self.buffer[..self.filled])? {
                self.buffer.copy_within(consumed..self.filled, 0);
                self.filled -= consumed;
                trace!(code = reply.code, "received");
                return Ok(reply);
            }

            if self.filled == self.buffer.len() {
                if self.buffer.len() * 2 > MAX_BUFFER_SIZE {
                    return Err(DialogIoError::ReplyTooLarge);
                }
                self.buffer.resize(self.buffer.len() * 2, 0);
            }

            let n = timeout(limit, self.stream.read(&mut self.buffer[self.filled..]))
                .await
                .map_err(|_| DialogIoError::TimedOut)??;
            if n == 0 {
                return Err(DialogIoError::ConnectionClosed);
            }
            self.filled += n;
        }
    }

    /// Send a command and read its reply, each within `limit`.
    pub async fn command(&mut self, line: &str, limit: Duration) -> Result<Reply, DialogIoError> {
        self.send_line(line, limit).await?;
        self.read_reply(limit).await
    }

    /// Stream the message payload dot-stuffed and CRLF-normalized, followed
    /// by the `.` terminator, within `limit`. The final-reply read is the
    /// caller's, with its own budget.
    pub async fn send_data(&mut self, content: &[u8], limit: Duration) -> Result<(), DialogIoError> {
        let stuffed = dot_stuff(content);
        timeout(limit, async {
            self.stream.write_all(&stuffed).await?;
            self.stream.write_all(b".\r\n").await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| DialogIoError::TimedOut)??;
        Ok(())
    }
}

/// Dot-stuff and CRLF-normalize a payload for DATA.
///
/// Every line starting with `.` gets a second `.` prepended; every line ends
/// with CRLF, including the last.
fn dot_stuff(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 64);
    for line in content.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.starts_with(b".") {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    // A trailing newline in the input produces one spurious empty line.
    if content.ends_with(b"\n") {
        out.truncate(out.len() - 2);
    }
    out
}
