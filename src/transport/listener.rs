//! Inbound listener.
//!
//! A minimal SMTP server that accepts every message it is offered and reports
//! each one to a [`DeliverySink`] together with the value of the correlation
//! header. It is bound before the first message is sent and keeps accepting
//! until it is shut down or dropped.
//!
//! A message is reported when its mail transaction ends: on the session's next
//! `MAIL`, `RSET`, `HELO`/`EHLO` or `QUIT`, or when the client disconnects.
//! By then the sending client has read the final `250`, so the receive instant
//! never precedes the sender's send-complete instant.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use super::TransportError;
use crate::message::extract_header;

/// One message accepted by the listener
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Correlation header value, if the message carried one
    pub header_value: Option<String>,
    /// Taken when the mail transaction carrying the message ended
    pub received_at: Instant,
    /// Time spent reading the message content
    pub data_elapsed: Duration,
    pub size: usize,
}

/// Receives deliveries from the listener's connection handlers
pub trait DeliverySink: Send + Sync + 'static {
    fn on_delivery(&self, delivery: Delivery);
}

/// Bounds on what one inbound session may buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerLimits {
    /// Longest command or content line read in one piece
    pub max_line: usize,
    /// Largest message accepted; larger ones get `552`
    pub max_message_size: usize,
}

impl Default for ListenerLimits {
    fn default() -> Self {
        Self {
            max_line: 64 * 1024,
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

/// Running inbound SMTP listener
pub struct SmtpListener {
    local_addr: SocketAddr,
    accept_loop: JoinHandle<()>,
}

impl SmtpListener {
    /// Bind `host:port` and start accepting connections in the background.
    pub async fn bind(
        host: &str,
        port: u16,
        header_name: &str,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Self, TransportError> {
        Self::bind_with_limits(host, port, header_name, sink, ListenerLimits::default()).await
    }

    pub async fn bind_with_limits(
        host: &str,
        port: u16,
        header_name: &str,
        sink: Arc<dyn DeliverySink>,
        limits: ListenerLimits,
    ) -> Result<Self, TransportError> {
        let address = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| TransportError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { address, source })?;

        debug!("Inbound listener bound to {}", local_addr);
        let header_name: Arc<str> = Arc::from(header_name);
        let accept_loop = tokio::spawn(accept_loop(listener, header_name, sink, limits));

        Ok(Self {
            local_addr,
            accept_loop,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop every open inbound session
    pub fn shutdown(self) {
        debug!("Inbound listener on {} shutting down", self.local_addr);
        // Drop aborts the accept loop, which owns the session tasks
    }
}

impl Drop for SmtpListener {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    header_name: Arc<str>,
    sink: Arc<dyn DeliverySink>,
    limits: ListenerLimits,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    trace!("Inbound connection from {}", peer);
                    let _ = socket.set_nodelay(true);
                    let header_name = header_name.clone();
                    let sink = sink.clone();
                    sessions.spawn(async move {
                        if let Err(e) = serve(socket, &header_name, sink.as_ref(), &limits).await {
                            debug!("Inbound session with {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept inbound connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        warn!("Inbound session panicked: {}", e);
                    }
                }
            }
        }
    }
}

async fn reply(stream: &mut BufStream<TcpStream>, text: &str) -> std::io::Result<()> {
    stream.write_all(text.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

/// Read up to `max_line` bytes of one line. The chunk ends without `\n` when
/// the line is longer than that or the peer disconnected mid-line.
async fn read_chunk(
    stream: &mut BufStream<TcpStream>,
    buf: &mut Vec<u8>,
    max_line: usize,
) -> std::io::Result<usize> {
    (&mut *stream)
        .take(max_line as u64)
        .read_until(b'\n', buf)
        .await
}

/// Skip the remainder of an overlong line
async fn discard_line(stream: &mut BufStream<TcpStream>, max_line: usize) -> std::io::Result<()> {
    let mut rest = Vec::new();
    loop {
        rest.clear();
        if read_chunk(stream, &mut rest, max_line).await? == 0 || rest.ends_with(b"\n") {
            return Ok(());
        }
    }
}

enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
    Disconnected,
}

/// Read message content up to the lone `.` line, undoing dot-stuffing.
///
/// Content beyond `limits.max_message_size` is discarded while the terminator
/// is still looked for, so the session stays usable after a `552`.
async fn read_data(
    stream: &mut BufStream<TcpStream>,
    limits: &ListenerLimits,
) -> std::io::Result<DataOutcome> {
    let mut data = Vec::new();
    let mut chunk = Vec::new();
    let mut line_start = true;
    let mut oversized = false;
    loop {
        chunk.clear();
        if read_chunk(stream, &mut chunk, limits.max_line).await? == 0 {
            return Ok(DataOutcome::Disconnected);
        }
        if line_start && (chunk == b".\r\n" || chunk == b".\n") {
            return Ok(if oversized {
                DataOutcome::TooLarge
            } else {
                DataOutcome::Complete(data)
            });
        }
        if !oversized {
            let content = if line_start && chunk.starts_with(b".") {
                &chunk[1..]
            } else {
                &chunk[..]
            };
            if data.len() + content.len() > limits.max_message_size {
                oversized = true;
                data = Vec::new();
            } else {
                data.extend_from_slice(content);
            }
        }
        line_start = chunk.ends_with(b"\n");
    }
}

/// Message accepted with `250` whose transaction has not ended yet
struct PendingDelivery {
    header_value: Option<String>,
    data_elapsed: Duration,
    size: usize,
}

impl PendingDelivery {
    fn complete(self, sink: &dyn DeliverySink) {
        sink.on_delivery(Delivery {
            header_value: self.header_value,
            received_at: Instant::now(),
            data_elapsed: self.data_elapsed,
            size: self.size,
        });
    }
}

async fn serve(
    socket: TcpStream,
    header_name: &str,
    sink: &dyn DeliverySink,
    limits: &ListenerLimits,
) -> std::io::Result<()> {
    let mut stream = BufStream::new(socket);
    reply(&mut stream, "220 smtp-sampler ESMTP ready").await?;

    let mut has_sender = false;
    let mut recipients = 0usize;
    let mut pending: Option<PendingDelivery> = None;
    let mut raw = Vec::new();

    let result = loop {
        raw.clear();
        let read = match read_chunk(&mut stream, &mut raw, limits.max_line).await {
            Ok(read) => read,
            Err(e) => break Err(e),
        };
        if read == 0 {
            break Ok(());
        }
        if !raw.ends_with(b"\n") {
            let rejected = match discard_line(&mut stream, limits.max_line).await {
                Ok(()) => reply(&mut stream, "500 5.5.2 Line too long").await,
                Err(e) => Err(e),
            };
            if let Err(e) = rejected {
                break Err(e);
            }
            continue;
        }

        let line = String::from_utf8_lossy(&raw);
        let command = line.trim_end_matches(['\r', '\n']);
        trace!("Inbound C: {}", command);
        let verb = command
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        // The previous transaction ends when the client moves on
        if matches!(verb.as_str(), "MAIL" | "RSET" | "QUIT" | "EHLO" | "HELO") {
            if let Some(delivery) = pending.take() {
                delivery.complete(sink);
            }
        }

        let outcome = match verb.as_str() {
            "EHLO" => {
                has_sender = false;
                recipients = 0;
                let greeting = format!(
                    "250-smtp-sampler\r\n250-8BITMIME\r\n250 SIZE {}",
                    limits.max_message_size
                );
                reply(&mut stream, &greeting).await
            }
            "HELO" => {
                has_sender = false;
                recipients = 0;
                reply(&mut stream, "250 smtp-sampler").await
            }
            "MAIL" => {
                has_sender = true;
                recipients = 0;
                reply(&mut stream, "250 2.1.0 Ok").await
            }
            "RCPT" if !has_sender => reply(&mut stream, "503 5.5.1 Need MAIL first").await,
            "RCPT" => {
                recipients += 1;
                reply(&mut stream, "250 2.1.5 Ok").await
            }
            "DATA" if recipients == 0 => reply(&mut stream, "503 5.5.1 Need RCPT first").await,
            "DATA" => {
                has_sender = false;
                recipients = 0;
                match receive_message(&mut stream, header_name, limits).await {
                    Ok(Exchange::Accepted(delivery)) => {
                        pending = Some(delivery);
                        Ok(())
                    }
                    Ok(Exchange::Rejected) => Ok(()),
                    Ok(Exchange::Disconnected) => break Ok(()),
                    Err(e) => Err(e),
                }
            }
            "RSET" => {
                has_sender = false;
                recipients = 0;
                reply(&mut stream, "250 2.0.0 Ok").await
            }
            "NOOP" => reply(&mut stream, "250 2.0.0 Ok").await,
            "QUIT" => break reply(&mut stream, "221 2.0.0 Bye").await,
            "" => reply(&mut stream, "500 5.5.2 Error: bad syntax").await,
            _ => reply(&mut stream, "502 5.5.2 Error: command not recognized").await,
        };
        if let Err(e) = outcome {
            break Err(e);
        }
    };

    // Disconnect also ends an accepted transaction
    if let Some(delivery) = pending.take() {
        delivery.complete(sink);
    }
    result
}

enum Exchange {
    Accepted(PendingDelivery),
    Rejected,
    Disconnected,
}

/// Run the DATA exchange after the client sent `DATA`
async fn receive_message(
    stream: &mut BufStream<TcpStream>,
    header_name: &str,
    limits: &ListenerLimits,
) -> std::io::Result<Exchange> {
    reply(stream, "354 End data with <CR><LF>.<CR><LF>").await?;
    let started = Instant::now();
    match read_data(stream, limits).await? {
        DataOutcome::Complete(data) => {
            let data_elapsed = started.elapsed();
            reply(stream, "250 2.0.0 Ok: queued").await?;
            Ok(Exchange::Accepted(PendingDelivery {
                header_value: extract_header(&data, header_name),
                data_elapsed,
                size: data.len(),
            }))
        }
        DataOutcome::TooLarge => {
            debug!(
                "Inbound message larger than {} bytes rejected",
                limits.max_message_size
            );
            reply(stream, "552 5.3.4 Message size exceeds fixed limit").await?;
            Ok(Exchange::Rejected)
        }
        DataOutcome::Disconnected => Ok(Exchange::Disconnected),
    }
}
