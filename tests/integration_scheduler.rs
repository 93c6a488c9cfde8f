use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use smtp_sampler::context::RunContext;
use smtp_sampler::message::{extract_header, parse_message_id};
use smtp_sampler::scheduler::{plan_batches, ConnectionScheduler};
use smtp_sampler::task::TaskOutcome;
use smtp_sampler::transport::{ServerResponse, SmtpError, TransportError};
use smtp_sampler::{
    ConfigError, Credentials, Endpoint, Envelope, MailConnection, MailTransport,
    MessageTemplate, SamplerError,
};

const HEADER: &str = "X-BENCHMARK-MESSAGE-ID";

/// Records the identifiers seen on every connection; refuses every
/// `refuse_every`-th connect.
struct RecordingTransport {
    connections: Arc<Mutex<Vec<Arc<Mutex<Vec<u64>>>>>>,
    attempts: Mutex<usize>,
    refuse_every: Option<usize>,
    latency: Duration,
}

struct RecordingConnection {
    ids: Arc<Mutex<Vec<u64>>>,
    latency: Duration,
}

impl RecordingTransport {
    fn new(refuse_every: Option<usize>, latency: Duration) -> Self {
        Self {
            connections: Arc::new(Mutex::new(Vec::new())),
            attempts: Mutex::new(0),
            refuse_every,
            latency,
        }
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _credentials: Option<&Credentials>,
    ) -> Result<Box<dyn MailConnection>, TransportError> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            *attempts += 1;
            *attempts
        };
        if let Some(every) = self.refuse_every {
            if attempt % every == 0 {
                return Err(TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    source: SmtpError::Protocol("connection refused".to_string()),
                });
            }
        }
        let ids = Arc::new(Mutex::new(Vec::new()));
        self.connections.lock().push(ids.clone());
        Ok(Box::new(RecordingConnection {
            ids,
            latency: self.latency,
        }))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[async_trait]
impl MailConnection for RecordingConnection {
    async fn send(
        &mut self,
        _envelope: &Envelope,
        message: &[u8],
    ) -> Result<ServerResponse, TransportError> {
        let id = extract_header(message, HEADER)
            .as_deref()
            .and_then(parse_message_id)
            .ok_or_else(|| TransportError::Send(SmtpError::Protocol("no id".to_string())))?;
        self.ids.lock().push(id);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(ServerResponse {
            code: 250,
            lines: vec!["ok".to_string()],
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn context() -> Arc<RunContext> {
    Arc::new(RunContext::new(Endpoint::new("127.0.0.1", 25), None, HEADER, false).unwrap())
}

#[test]
fn batch_partitions_cover_every_message() {
    for messages in 1..60 {
        for connections in 1..=messages.min(12) {
            for per_connection in 1..8 {
                let batches = plan_batches(messages, connections, per_connection).unwrap();
                let size = per_connection.min(messages / connections);
                assert_eq!(batches.iter().sum::<usize>(), messages);
                assert!(batches.iter().all(|&b| b >= 1 && b <= size));
                assert!(batches.len() >= connections);
            }
        }
    }
}

#[test]
fn partition_rejects_impossible_workloads() {
    assert!(matches!(
        plan_batches(3, 4, 1),
        Err(ConfigError::FewerMessagesThanConnections { .. })
    ));
    assert!(matches!(plan_batches(0, 1, 1), Err(ConfigError::NoMessages)));
    assert!(matches!(plan_batches(5, 0, 1), Err(ConfigError::NoConnections)));
}

#[tokio::test]
async fn identifiers_are_unique_and_ordered_per_connection() -> Result<()> {
    let transport = Arc::new(RecordingTransport::new(None, Duration::ZERO));
    let connections = transport.connections.clone();
    let context = context();

    let template = MessageTemplate::generate("test", "from@localhost", "to@localhost", 10);
    let envelope = template.envelope()?;
    let batches = plan_batches(57, 6, 4)?;

    let scheduler = ConnectionScheduler::new(6, transport, context.clone());
    let summary = scheduler.run(&batches, &template, &envelope, None).await?;

    assert_eq!(summary.tasks.len(), batches.len());
    assert!(summary
        .tasks
        .iter()
        .all(|t| t.outcome == TaskOutcome::Completed));

    let mut seen = HashSet::new();
    for connection in connections.lock().iter() {
        let ids = connection.lock();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        for id in ids.iter() {
            assert!(seen.insert(*id), "identifier {} issued twice", id);
        }
    }
    assert_eq!(seen.len(), 57);
    assert_eq!(context.sent.len(), 57);
    Ok(())
}

#[tokio::test]
async fn failed_connections_do_not_stop_the_run() -> Result<()> {
    let transport = Arc::new(RecordingTransport::new(Some(3), Duration::ZERO));
    let context = context();

    let template = MessageTemplate::generate("test", "from@localhost", "to@localhost", 10);
    let envelope = template.envelope()?;
    let batches = plan_batches(12, 2, 2)?;

    let scheduler = ConnectionScheduler::new(2, transport, context.clone());
    let summary = scheduler.run(&batches, &template, &envelope, None).await?;

    let failed = summary
        .tasks
        .iter()
        .filter(|t| t.outcome == TaskOutcome::ConnectFailed)
        .count();
    assert_eq!(failed, 2);

    let counters = context.counters.snapshot();
    assert_eq!(counters.connections_dispatched, 6);
    assert_eq!(counters.connections_failed, 2);
    assert_eq!(counters.messages_delivered, 8);
    assert_eq!(context.sent.len(), 8);
    Ok(())
}

#[tokio::test]
async fn deadline_abandons_running_tasks() -> Result<()> {
    let transport = Arc::new(RecordingTransport::new(None, Duration::from_millis(300)));
    let context = context();

    let template = MessageTemplate::generate("test", "from@localhost", "to@localhost", 10);
    let envelope = template.envelope()?;
    let batches = plan_batches(4, 1, 4)?;

    let scheduler = ConnectionScheduler::new(1, transport, context);
    let result = scheduler
        .run(&batches, &template, &envelope, Some(Duration::from_millis(50)))
        .await;

    assert!(matches!(result, Err(SamplerError::SendPhaseTimeout(_))));
    Ok(())
}
