//! Mail transport capability.
//!
//! The send side only ever talks to a [`MailTransport`]: it opens one
//! [`MailConnection`] per send task, sends messages over it and closes it. The
//! concrete SMTP client lives in [`smtp`]; tests substitute their own transports.
//! The receive side uses the [`listener`] module, a minimal SMTP server that
//! reports every accepted message to a [`DeliverySink`].

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::message::Envelope;

pub mod listener;
pub mod smtp;
pub mod tls;

pub use listener::{Delivery, DeliverySink, ListenerLimits, SmtpListener};
pub use smtp::SmtpTransport;

/// Host and port of an SMTP endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// AUTH credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Client-side protocol options
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upgrade every session with STARTTLS before AUTH and MAIL
    pub starttls: bool,
    /// Name announced in EHLO/HELO
    pub helo_name: String,
    /// Upper bound for every individual network step
    pub io_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            starttls: false,
            helo_name: crate::defaults::HELO_NAME.to_string(),
            io_timeout: crate::defaults::IO_TIMEOUT,
        }
    }
}

/// Complete (possibly multi-line) server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl ServerResponse {
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn text(&self) -> String {
        self.lines.join(" ")
    }
}

impl fmt::Display for ServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text())
    }
}

/// Protocol-level fault
#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("server replied {code} {text}")]
    Rejected { code: u16, text: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl SmtpError {
    pub fn rejected(response: &ServerResponse) -> Self {
        SmtpError::Rejected {
            code: response.code,
            text: response.text(),
        }
    }
}

/// Transport failure, tagged with the phase it happened in
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: SmtpError,
    },

    #[error("send failed: {0}")]
    Send(#[source] SmtpError),

    #[error("close failed: {0}")]
    Close(#[source] SmtpError),

    #[error("cannot bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Opens connections to a mail server
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Open a session ready to accept `MAIL FROM`
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn MailConnection>, TransportError>;

    /// Get transport name for identification
    fn name(&self) -> &'static str;
}

/// One open session, exclusively owned by a single send task
#[async_trait]
pub trait MailConnection: Send {
    /// Transmit one message; returns the server's reply to the end of data
    async fn send(
        &mut self,
        envelope: &Envelope,
        message: &[u8],
    ) -> Result<ServerResponse, TransportError>;

    /// End the session
    async fn close(&mut self) -> Result<(), TransportError>;
}
