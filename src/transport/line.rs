// MIT License - Copyright (c) 2021 TJForc
// Line-oriented Telnet transport

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use crate::constants::{LINE_TERMINATOR, WELCOME_BANNER};
use crate::error::{Result, TesiraError};
use crate::transport::telnet::TelnetFilter;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 1024;

/// An open stream plus everything received but not yet consumed.
struct Link {
    reader: Reader,
    writer: Writer,
    buffer: Vec<u8>,
    filter: TelnetFilter,
}

impl Link {
    /// Read until `delimiter` is buffered and return everything up to and including it.
    ///
    /// Cancel-safe: bytes read before cancellation stay in `buffer`.
    async fn read_until(&mut self, delimiter: &[u8], transport: &'static str) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = find(&self.buffer, delimiter) {
                return Ok(self.buffer.drain(..pos + delimiter.len()).collect());
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(TesiraError::Disconnected { transport });
            }

            let mut replies = Vec::new();
            self.filter.feed(&chunk[..n], &mut self.buffer, &mut replies);
            if !replies.is_empty() {
                debug!("{} - Refusing {} bytes of telnet options", transport, replies.len());
                self.writer.write_all(&replies).await?;
                self.writer.flush().await?;
            }
        }
    }
}

enum LinkState {
    Unopened,
    Open(Link),
    Closed,
}

/// One Telnet session to the device, read and written line by line.
///
/// Lifecycle is `Unopened → Open → Closed`; a closed transport cannot be reopened.
pub struct LineTransport {
    name: &'static str,
    state: LinkState,
}

impl LineTransport {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: LinkState::Unopened,
        }
    }

    /// Connect over TCP and consume the welcome banner, both within `limit`.
    pub async fn connect(&mut self, host: &str, port: u16, limit: Duration) -> Result<()> {
        let address = format!("{host}:{port}");
        debug!("{} - Connecting to {}", self.name, address);

        let stream = match timeout(limit, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TesiraError::Connect { address, source }),
            Err(_) => {
                return Err(TesiraError::Timeout {
                    context: format!("connection to {address}"),
                });
            }
        };
        let _ = stream.set_nodelay(true);

        self.attach(stream, limit).await?;
        info!("{} - Successfully connected to {}", self.name, address);
        Ok(())
    }

    /// Take ownership of an already-connected stream and consume the welcome banner.
    pub async fn attach<S>(&mut self, stream: S, limit: Duration) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        match self.state {
            LinkState::Unopened => {}
            LinkState::Open(_) => return Ok(()),
            LinkState::Closed => {
                return Err(TesiraError::NotConnected {
                    transport: self.name,
                });
            }
        }

        let (reader, writer) = tokio::io::split(stream);
        self.state = LinkState::Open(Link {
            reader: Box::new(reader),
            writer: Box::new(writer),
            buffer: Vec::new(),
            filter: TelnetFilter::new(),
        });

        if let Err(e) = self.read_until(WELCOME_BANNER, limit).await {
            self.close();
            return Err(match e {
                TesiraError::Timeout { .. } => TesiraError::Timeout {
                    context: format!("welcome banner on {}", self.name),
                },
                other => other,
            });
        }
        Ok(())
    }

    /// Send one command line, terminated with CRLF, and flush.
    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        let name = self.name;
        let link = self.link_mut()?;
        debug!("{} - Sending {}", name, text);

        let mut framed = String::with_capacity(text.len() + LINE_TERMINATOR.len());
        framed.push_str(text);
        framed.push_str(LINE_TERMINATOR);
        link.writer.write_all(framed.as_bytes()).await?;
        link.writer.flush().await?;
        Ok(())
    }

    /// Wait for one line; NUL padding, the terminator and surrounding whitespace are removed.
    pub async fn read_line(&mut self, limit: Duration) -> Result<String> {
        let line = self.read_until("\n", limit).await?;
        debug!("{} - Received {}", self.name, line);
        Ok(line)
    }

    /// Wait until `delimiter` has been received and return the cleaned text up to it.
    pub async fn read_until(&mut self, delimiter: &str, limit: Duration) -> Result<String> {
        let name = self.name;
        let link = self.link_mut()?;
        match timeout(limit, link.read_until(delimiter.as_bytes(), name)).await {
            Ok(Ok(bytes)) => Ok(clean(&bytes)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TesiraError::Timeout {
                context: format!("{delimiter:?} on {name}"),
            }),
        }
    }

    /// Release the stream. Idempotent; every later read or write fails.
    pub fn close(&mut self) {
        if let LinkState::Open(_) = std::mem::replace(&mut self.state, LinkState::Closed) {
            debug!("{} - Closed", self.name);
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, LinkState::Open(_))
    }

    /// True unless the transport is open.
    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    fn link_mut(&mut self) -> Result<&mut Link> {
        match &mut self.state {
            LinkState::Open(link) => Ok(link),
            LinkState::Unopened | LinkState::Closed => Err(TesiraError::NotConnected {
                transport: self.name,
            }),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn clean(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .replace('\0', "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::telnet::{DO, IAC, WONT};
    use tokio::io::{duplex, DuplexStream};

    const LIMIT: Duration = Duration::from_millis(500);

    async fn open_pair() -> (LineTransport, DuplexStream) {
        let (client, mut server) = duplex(4096);
        server.write_all(WELCOME_BANNER.as_bytes()).await.unwrap();
        let mut transport = LineTransport::new("test");
        transport.attach(client, LIMIT).await.unwrap();
        (transport, server)
    }

    #[tokio::test]
    async fn test_attach_consumes_banner() {
        let (mut transport, mut server) = open_pair().await;
        assert!(transport.is_open());
        server.write_all(b"+OK\r\n").await.unwrap();
        assert_eq!(transport.read_line(LIMIT).await.unwrap(), "+OK");
    }

    #[tokio::test]
    async fn test_banner_after_negotiation() {
        let (client, mut server) = duplex(4096);
        let mut preamble = vec![IAC, DO, 24, IAC, DO, 32];
        preamble.extend_from_slice(WELCOME_BANNER.as_bytes());
        server.write_all(&preamble).await.unwrap();

        let mut transport = LineTransport::new("test");
        transport.attach(client, LIMIT).await.unwrap();

        let mut refusal = [0u8; 6];
        server.read_exact(&mut refusal).await.unwrap();
        assert_eq!(refusal, [IAC, WONT, 24, IAC, WONT, 32]);
    }

    #[tokio::test]
    async fn test_banner_timeout() {
        let (client, _server) = duplex(4096);
        let mut transport = LineTransport::new("test");
        let err = transport
            .attach(client, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_read_line_strips_nul_and_terminator() {
        let (mut transport, mut server) = open_pair().await;
        server
            .write_all(b"\0\0+OK \"value\":\"SN42\"\0\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(
            transport.read_line(LIMIT).await.unwrap(),
            "+OK \"value\":\"SN42\""
        );
        assert_eq!(transport.read_line(LIMIT).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_line_split_across_writes() {
        let (mut transport, mut server) = open_pair().await;
        let reader = tokio::spawn(async move {
            let line = transport.read_line(LIMIT).await.unwrap();
            (transport, line)
        });
        server.write_all(b"! \"publishToken\":").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(b"\"a_mute_1\" \"value\":true\r\n").await.unwrap();
        let (_transport, line) = reader.await.unwrap();
        assert_eq!(line, "! \"publishToken\":\"a_mute_1\" \"value\":true");
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut transport, _server) = open_pair().await;
        let err = transport
            .read_line(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        // still usable afterwards
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_write_line_adds_crlf() {
        let (mut transport, mut server) = open_pair().await;
        transport.write_line("DEVICE get serialNumber").await.unwrap();
        let mut buf = vec![0u8; 25];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"DEVICE get serialNumber\r\n");
    }

    #[tokio::test]
    async fn test_eof_is_connection_error() {
        let (mut transport, server) = open_pair().await;
        drop(server);
        let err = transport.read_line(LIMIT).await.unwrap_err();
        assert!(matches!(err, TesiraError::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (mut transport, _server) = open_pair().await;
        transport.close();
        transport.close();
        assert!(transport.is_closed());
        assert!(matches!(
            transport.write_line("x").await,
            Err(TesiraError::NotConnected { .. })
        ));
        assert!(matches!(
            transport.read_line(LIMIT).await,
            Err(TesiraError::NotConnected { .. })
        ));

        let (client, _other) = duplex(64);
        assert!(transport.attach(client, LIMIT).await.is_err());
    }

    #[tokio::test]
    async fn test_unopened_rejects_io() {
        let mut transport = LineTransport::new("test");
        assert!(transport.is_closed());
        assert!(matches!(
            transport.write_line("x").await,
            Err(TesiraError::NotConnected { transport: "test" })
        ));
    }
}
