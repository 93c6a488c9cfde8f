//! SMTP client implementation of [`MailTransport`].
//!
//! A connection walks through greeting, EHLO (falling back to HELO), the optional
//! STARTTLS upgrade with a second EHLO, and optional AUTH before it is handed to
//! the send task. Each message is then sent with MAIL FROM, RCPT TO and DATA.
//! Every network step is bounded by the configured I/O timeout.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use super::{
    tls, Credentials, Endpoint, MailConnection, MailTransport, ServerResponse, SmtpError,
    TransportConfig, TransportError,
};
use crate::message::Envelope;

/// Plain TCP before STARTTLS, TLS after it
trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Run `operation`, mapping an elapsed deadline to [`SmtpError::Timeout`]
async fn bounded<T, F>(limit: Duration, operation: F) -> Result<T, SmtpError>
where
    F: Future<Output = Result<T, SmtpError>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(SmtpError::Timeout(limit)),
    }
}

/// Read one complete reply, following `NNN-` continuation lines
async fn read_response<S>(stream: &mut S) -> Result<ServerResponse, SmtpError>
where
    S: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Err(SmtpError::Protocol(
                "connection closed by server".to_string(),
            ));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let code = trimmed
            .get(..3)
            .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| SmtpError::Protocol(format!("malformed reply line {:?}", trimmed)))?;
        let separator = trimmed.as_bytes().get(3).copied();
        lines.push(trimmed.get(4..).unwrap_or("").to_string());

        if separator != Some(b'-') {
            return Ok(ServerResponse { code, lines });
        }
    }
}

/// Convert line endings to CRLF, escape leading dots and terminate the last line.
pub(crate) fn dot_stuff(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + message.len() / 64 + 2);
    let mut at_line_start = true;
    let mut previous = 0u8;
    for &byte in message {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
        previous = byte;
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn expect_positive(response: ServerResponse) -> Result<ServerResponse, SmtpError> {
    if response.is_positive() {
        Ok(response)
    } else {
        Err(SmtpError::rejected(&response))
    }
}

fn expect_code(response: ServerResponse, code: u16) -> Result<ServerResponse, SmtpError> {
    if response.code == code {
        Ok(response)
    } else {
        Err(SmtpError::rejected(&response))
    }
}

/// EHLO keywords
#[derive(Debug, Default, Clone)]
struct Capabilities {
    keywords: Vec<String>,
}

impl Capabilities {
    fn from_ehlo(response: &ServerResponse) -> Self {
        Self {
            keywords: response.lines.iter().skip(1).cloned().collect(),
        }
    }

    fn supports(&self, keyword: &str) -> bool {
        self.keywords.iter().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|k| k.eq_ignore_ascii_case(keyword))
        })
    }

    fn auth_mechanisms(&self) -> Vec<String> {
        self.keywords
            .iter()
            .filter_map(|line| {
                let upper = line.to_ascii_uppercase();
                upper
                    .strip_prefix("AUTH ")
                    .or_else(|| upper.strip_prefix("AUTH="))
                    .map(|rest| rest.to_string())
            })
            .flat_map(|rest| {
                rest.split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

struct Session {
    stream: BufStream<Box<dyn SessionStream>>,
    io_timeout: Duration,
}

impl Session {
    fn new(stream: Box<dyn SessionStream>, io_timeout: Duration) -> Self {
        Self {
            stream: BufStream::new(stream),
            io_timeout,
        }
    }

    async fn read_response(&mut self) -> Result<ServerResponse, SmtpError> {
        let response = bounded(self.io_timeout, read_response(&mut self.stream)).await?;
        trace!("S: {}", response);
        Ok(response)
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SmtpError> {
        let stream = &mut self.stream;
        bounded(self.io_timeout, async move {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await?;
            Ok::<(), SmtpError>(())
        })
        .await
    }

    async fn command(&mut self, line: &str) -> Result<ServerResponse, SmtpError> {
        trace!("C: {}", line);
        self.write_line(line).await?;
        self.read_response().await
    }

    /// Like [`Session::command`], without logging the line
    async fn secret_command(&mut self, line: &str) -> Result<ServerResponse, SmtpError> {
        trace!("C: <credentials>");
        self.write_line(line).await?;
        self.read_response().await
    }

    async fn hello(&mut self, name: &str) -> Result<Capabilities, SmtpError> {
        let response = self.command(&format!("EHLO {}", name)).await?;
        if response.is_positive() {
            return Ok(Capabilities::from_ehlo(&response));
        }
        debug!("EHLO refused ({}), falling back to HELO", response);
        expect_positive(self.command(&format!("HELO {}", name)).await?)?;
        Ok(Capabilities::default())
    }

    async fn upgrade(self, connector: &TlsConnector, host: &str) -> Result<Session, SmtpError> {
        let io_timeout = self.io_timeout;
        let server_name = tls::server_name(host)?;
        let plain = self.stream.into_inner();
        let secured = bounded(io_timeout, async move {
            connector
                .connect(server_name, plain)
                .await
                .map_err(|e| SmtpError::Tls(e.to_string()))
        })
        .await?;
        Ok(Session::new(Box::new(secured), io_timeout))
    }

    async fn authenticate(
        &mut self,
        capabilities: &Capabilities,
        credentials: &Credentials,
    ) -> Result<(), SmtpError> {
        let mechanisms = capabilities.auth_mechanisms();
        let offers = |m: &str| mechanisms.iter().any(|offered| offered == m);

        if offers("PLAIN") || !offers("LOGIN") {
            let token = BASE64.encode(format!(
                "\0{}\0{}",
                credentials.username, credentials.password
            ));
            expect_code(self.secret_command(&format!("AUTH PLAIN {}", token)).await?, 235)?;
        } else {
            expect_code(self.command("AUTH LOGIN").await?, 334)?;
            expect_code(
                self.secret_command(&BASE64.encode(&credentials.username))
                    .await?,
                334,
            )?;
            expect_code(
                self.secret_command(&BASE64.encode(&credentials.password))
                    .await?,
                235,
            )?;
        }
        Ok(())
    }

    async fn transmit(
        &mut self,
        envelope: &Envelope,
        message: &[u8],
    ) -> Result<ServerResponse, SmtpError> {
        expect_positive(
            self.command(&format!("MAIL FROM:<{}>", envelope.from))
                .await?,
        )?;
        for recipient in &envelope.recipients {
            expect_positive(self.command(&format!("RCPT TO:<{}>", recipient)).await?)?;
        }
        expect_code(self.command("DATA").await?, 354)?;

        let data = dot_stuff(message);
        let stream = &mut self.stream;
        bounded(self.io_timeout, async move {
            stream.write_all(&data).await?;
            stream.write_all(b".\r\n").await?;
            stream.flush().await?;
            Ok::<(), SmtpError>(())
        })
        .await?;

        expect_positive(self.read_response().await?)
    }

    async fn quit(&mut self) -> Result<(), SmtpError> {
        let response = self.command("QUIT").await?;
        if response.code != 221 {
            debug!("Unexpected reply to QUIT: {}", response);
        }
        let stream = &mut self.stream;
        bounded(self.io_timeout, async move {
            stream.shutdown().await?;
            Ok::<(), SmtpError>(())
        })
        .await
    }
}

/// SMTP client transport
pub struct SmtpTransport {
    config: TransportConfig,
    tls: Option<TlsConnector>,
}

impl SmtpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, SmtpError> {
        let tls = if config.starttls {
            Some(tls::connector()?)
        } else {
            None
        };
        Ok(Self { config, tls })
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> Result<SmtpConnection, SmtpError> {
        let io_timeout = self.config.io_timeout;
        let address = (endpoint.host.as_str(), endpoint.port);
        let tcp = bounded(io_timeout, async move {
            Ok::<_, SmtpError>(TcpStream::connect(address).await?)
        })
        .await?;
        tcp.set_nodelay(true)?;

        let mut session = Session::new(Box::new(tcp), io_timeout);
        let greeting = expect_code(session.read_response().await?, 220)?;
        debug!("Connected to {}: {}", endpoint, greeting);

        let mut capabilities = session.hello(&self.config.helo_name).await?;

        if let Some(connector) = &self.tls {
            if !capabilities.supports("STARTTLS") {
                return Err(SmtpError::Protocol(
                    "server does not advertise STARTTLS".to_string(),
                ));
            }
            expect_code(session.command("STARTTLS").await?, 220)?;
            session = session.upgrade(connector, &endpoint.host).await?;
            capabilities = session.hello(&self.config.helo_name).await?;
        }

        if let Some(credentials) = credentials {
            session.authenticate(&capabilities, credentials).await?;
        }

        Ok(SmtpConnection {
            session,
            closed: false,
        })
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn MailConnection>, TransportError> {
        match self.open(endpoint, credentials).await {
            Ok(connection) => Ok(Box::new(connection)),
            Err(source) => Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                source,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "SMTP"
    }
}

/// Established SMTP session
pub struct SmtpConnection {
    session: Session,
    closed: bool,
}

#[async_trait]
impl MailConnection for SmtpConnection {
    async fn send(
        &mut self,
        envelope: &Envelope,
        message: &[u8],
    ) -> Result<ServerResponse, TransportError> {
        self.session
            .transmit(envelope, message)
            .await
            .map_err(TransportError::Send)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            warn!("SMTP connection closed twice");
            return Ok(());
        }
        self.closed = true;
        self.session.quit().await.map_err(TransportError::Close)
    }
}
