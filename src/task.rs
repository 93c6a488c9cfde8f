//! Send task: one connection, one batch of messages.
//!
//! A task connects, sends its batch strictly in order and always closes what it
//! opened. A failed connect abandons the whole batch; a failed send abandons the
//! rest of it. Neither is retried. Failures are recorded in the run counters and
//! never propagated to the scheduler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::ids::ConnectionId;
use crate::message::{encode_message_id, Envelope, MessageTemplate};
use crate::metrics::{bump, TimingCategory};
use crate::transport::MailTransport;
use crate::utils::format_duration;

/// How a send task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Every message of the batch was accepted
    Completed,
    /// The connection could not be opened; nothing was sent
    ConnectFailed,
    /// Message `index` of the batch failed and the rest was abandoned
    SendFailed { index: usize },
}

/// Per-task result handed back to the scheduler
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub connection_id: ConnectionId,
    pub batch_size: usize,
    pub outcome: TaskOutcome,
    /// Messages handed to the transport, successful or not
    pub sent: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Wall time from connect to close
    pub elapsed: Duration,
}

pub struct SendTask {
    connection_id: ConnectionId,
    batch_size: usize,
    /// Private copy; identifier headers are stamped into it
    message: MessageTemplate,
    envelope: Envelope,
    context: Arc<RunContext>,
    transport: Arc<dyn MailTransport>,
}

impl SendTask {
    pub fn new(
        connection_id: ConnectionId,
        batch_size: usize,
        message: MessageTemplate,
        envelope: Envelope,
        context: Arc<RunContext>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            connection_id,
            batch_size,
            message,
            envelope,
            context,
            transport,
        }
    }

    pub async fn run(mut self) -> TaskReport {
        let context = self.context.clone();
        let statistics = &context.statistics;
        let counters = &context.counters;

        bump(&counters.connections_dispatched);
        let mut report = TaskReport {
            connection_id: self.connection_id,
            batch_size: self.batch_size,
            outcome: TaskOutcome::Completed,
            sent: 0,
            delivered: 0,
            failed: 0,
            elapsed: Duration::ZERO,
        };

        let started = Instant::now();
        let mut connection = match self
            .transport
            .connect(&context.endpoint, context.credentials.as_ref())
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                bump(&counters.connections_failed);
                if context.verbose {
                    warn!("Connection {} failed: {}", self.connection_id, e);
                } else {
                    debug!("Connection {} failed: {}", self.connection_id, e);
                }
                report.outcome = TaskOutcome::ConnectFailed;
                report.elapsed = started.elapsed();
                return report;
            }
        };
        statistics.record(TimingCategory::ConnectionSetup, started.elapsed());
        bump(&counters.connections_established);

        let mut stamping = Duration::ZERO;
        let mut sending = Duration::ZERO;

        for index in 0..self.batch_size {
            let stamp_started = Instant::now();
            let id = context.next_message_id();
            self.message
                .set_header(&context.header_name, &encode_message_id(id));
            let payload = self.message.to_bytes();
            stamping += stamp_started.elapsed();

            let send_started = Instant::now();
            let result = connection.send(&self.envelope, &payload).await;
            let send_finished = Instant::now();
            let elapsed = send_finished.duration_since(send_started);
            sending += elapsed;

            bump(&counters.messages_sent);
            report.sent += 1;

            match result {
                Ok(response) => {
                    if !context.sent.insert_first(id, send_finished) {
                        error!("Message identifier {} was recorded twice", id);
                    }
                    statistics.record(TimingCategory::MessageSend, elapsed);
                    bump(&counters.messages_delivered);
                    report.delivered += 1;
                    if context.verbose {
                        info!(
                            "Message delivered: {}/{} {} {}",
                            self.connection_id,
                            index,
                            format_duration(elapsed),
                            response
                        );
                    }
                }
                Err(e) => {
                    bump(&counters.messages_failed);
                    report.failed += 1;
                    if context.verbose {
                        warn!(
                            "Message failed: {}/{} {} {}",
                            self.connection_id,
                            index,
                            format_duration(elapsed),
                            e
                        );
                    } else {
                        debug!("Message {}/{} failed: {}", self.connection_id, index, e);
                    }
                    report.outcome = TaskOutcome::SendFailed { index };
                    break;
                }
            }
        }

        if let Err(e) = connection.close().await {
            debug!("Connection {}: {}", self.connection_id, e);
        }

        report.elapsed = started.elapsed();
        let handling = report
            .elapsed
            .saturating_sub(stamping)
            .saturating_sub(sending);
        statistics.record(TimingCategory::ConnectionHandling, handling);

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageTemplate;
    use crate::transport::{
        Credentials, Endpoint, MailConnection, ServerResponse, SmtpError, TransportError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the connect, or the send numbered `fail_on`, and counts closes
    struct ScriptedTransport {
        refuse: bool,
        fail_on: Option<usize>,
        sends: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    struct ScriptedConnection {
        fail_on: Option<usize>,
        sends: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        headers: Vec<String>,
    }

    #[async_trait]
    impl MailTransport for ScriptedTransport {
        async fn connect(
            &self,
            endpoint: &Endpoint,
            _credentials: Option<&Credentials>,
        ) -> Result<Box<dyn MailConnection>, TransportError> {
            if self.refuse {
                return Err(TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    source: SmtpError::Protocol("refused".to_string()),
                });
            }
            Ok(Box::new(ScriptedConnection {
                fail_on: self.fail_on,
                sends: self.sends.clone(),
                closes: self.closes.clone(),
                headers: Vec::new(),
            }))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[async_trait]
    impl MailConnection for ScriptedConnection {
        async fn send(
            &mut self,
            _envelope: &Envelope,
            message: &[u8],
        ) -> Result<ServerResponse, TransportError> {
            let index = self.sends.fetch_add(1, Ordering::SeqCst);
            let value = crate::message::extract_header(message, "X-Id").unwrap_or_default();
            self.headers.push(value);
            if Some(index) == self.fail_on {
                return Err(TransportError::Send(SmtpError::Rejected {
                    code: 554,
                    text: "rejected".to_string(),
                }));
            }
            Ok(ServerResponse {
                code: 250,
                lines: vec!["ok".to_string()],
            })
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            // Identifiers within one connection strictly increase
            let ids: Vec<u64> = self.headers.iter().filter_map(|h| h.parse().ok()).collect();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            Err(TransportError::Close(SmtpError::Protocol("noisy close".to_string())))
        }
    }

    fn setup(
        refuse: bool,
        fail_on: Option<usize>,
        batch: usize,
    ) -> (SendTask, Arc<RunContext>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let context = Arc::new(
            RunContext::new(Endpoint::new("localhost", 25), None, "X-Id", true).unwrap(),
        );
        let sends = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(ScriptedTransport {
            refuse,
            fail_on,
            sends: sends.clone(),
            closes: closes.clone(),
        });
        let message = MessageTemplate::generate("s", "a@b", "c@d", 10);
        let envelope = message.envelope().unwrap();
        let task = SendTask::new(7, batch, message, envelope, context.clone(), transport);
        (task, context, sends, closes)
    }

    #[tokio::test]
    async fn test_batch_completes() {
        let (task, context, sends, closes) = setup(false, None, 4);
        let report = task.run().await;

        assert_eq!(report.outcome, TaskOutcome::Completed);
        assert_eq!(report.connection_id, 7);
        assert_eq!((report.sent, report.delivered, report.failed), (4, 4, 0));
        assert_eq!(sends.load(Ordering::SeqCst), 4);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(context.sent.len(), 4);

        let counters = context.counters.snapshot();
        assert_eq!(counters.messages_sent, 4);
        assert_eq!(counters.messages_delivered, 4);
        assert_eq!(counters.connections_established, 1);

        let statistics = &context.statistics;
        assert_eq!(statistics.category(TimingCategory::MessageSend).count(), 4);
        assert_eq!(statistics.category(TimingCategory::ConnectionSetup).count(), 1);
        assert_eq!(statistics.category(TimingCategory::ConnectionHandling).count(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_abandons_rest_of_batch() {
        let (task, context, sends, closes) = setup(false, Some(1), 5);
        let report = task.run().await;

        assert_eq!(report.outcome, TaskOutcome::SendFailed { index: 1 });
        assert_eq!((report.sent, report.delivered, report.failed), (2, 1, 1));
        assert_eq!(sends.load(Ordering::SeqCst), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        // Failed sends never enter the send-time table
        assert_eq!(context.sent.len(), 1);

        let counters = context.counters.snapshot();
        assert_eq!(
            counters.messages_sent,
            counters.messages_delivered + counters.messages_failed
        );
    }

    #[tokio::test]
    async fn test_connect_failure_sends_nothing() {
        let (task, context, sends, closes) = setup(true, None, 3);
        let report = task.run().await;

        assert_eq!(report.outcome, TaskOutcome::ConnectFailed);
        assert_eq!(report.sent, 0);
        assert_eq!(sends.load(Ordering::SeqCst), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        let counters = context.counters.snapshot();
        assert_eq!(counters.connections_dispatched, 1);
        assert_eq!(counters.connections_failed, 1);
        assert_eq!(counters.connections_established, 0);
        assert_eq!(
            context
                .statistics
                .category(TimingCategory::ConnectionSetup)
                .count(),
            0
        );
    }
}
