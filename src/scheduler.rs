//! Connection scheduler.
//!
//! Splits the message count into batches and runs one [`SendTask`] per batch,
//! with at most `concurrency` tasks in flight. Surplus batches wait for a
//! permit. The send phase completes once every task has finished, or fails as a
//! whole when the optional deadline elapses first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::context::RunContext;
use crate::error::{ConfigError, SamplerError};
use crate::message::{Envelope, MessageTemplate};
use crate::task::{SendTask, TaskReport};
use crate::transport::MailTransport;

/// Split `messages` into per-connection batches.
///
/// The batch size is `min(per_connection, messages / connections)` so every
/// connection gets work; the last batch takes the remainder.
///
/// ## Examples
///
/// ```rust
/// # use smtp_sampler::scheduler::plan_batches;
/// assert_eq!(plan_batches(10, 3, 5).unwrap(), vec![3, 3, 3, 1]);
/// assert_eq!(plan_batches(100, 10, 1).unwrap().len(), 100);
/// ```
pub fn plan_batches(
    messages: usize,
    connections: usize,
    per_connection: usize,
) -> Result<Vec<usize>, ConfigError> {
    if messages == 0 {
        return Err(ConfigError::NoMessages);
    }
    if connections == 0 {
        return Err(ConfigError::NoConnections);
    }
    if per_connection == 0 {
        return Err(ConfigError::NoMessagesPerConnection);
    }
    if messages < connections {
        return Err(ConfigError::FewerMessagesThanConnections {
            messages,
            connections,
        });
    }

    let batch_size = per_connection.min(messages / connections);
    let mut batches = vec![batch_size; messages / batch_size];
    let remainder = messages % batch_size;
    if remainder > 0 {
        batches.push(remainder);
    }
    Ok(batches)
}

/// Result of a completed send phase
#[derive(Debug, Clone)]
pub struct SendPhaseSummary {
    pub tasks: Vec<TaskReport>,
    pub elapsed: Duration,
}

pub struct ConnectionScheduler {
    concurrency: usize,
    transport: Arc<dyn MailTransport>,
    context: Arc<RunContext>,
}

impl ConnectionScheduler {
    pub fn new(
        concurrency: usize,
        transport: Arc<dyn MailTransport>,
        context: Arc<RunContext>,
    ) -> Self {
        Self {
            concurrency,
            transport,
            context,
        }
    }

    /// Run one send task per batch and wait for all of them.
    ///
    /// If `deadline` elapses first, the tasks still running are abandoned and
    /// [`SamplerError::SendPhaseTimeout`] is returned.
    pub async fn run(
        &self,
        batches: &[usize],
        template: &MessageTemplate,
        envelope: &Envelope,
        deadline: Option<Duration>,
    ) -> Result<SendPhaseSummary, SamplerError> {
        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        info!(
            "Dispatching {} connections ({} concurrent) via {}",
            batches.len(),
            self.concurrency,
            self.transport.name()
        );

        for &batch in batches {
            let task = SendTask::new(
                self.context.next_connection_id(),
                batch,
                template.clone(),
                envelope.clone(),
                self.context.clone(),
                self.transport.clone(),
            );
            let permits = permits.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return None;
                };
                Some(task.run().await)
            });
        }

        let drain = async {
            let mut reports = Vec::with_capacity(batches.len());
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Some(report)) => {
                        debug!(
                            "Connection {} finished: {:?}",
                            report.connection_id, report.outcome
                        );
                        reports.push(report);
                    }
                    Ok(None) => {}
                    Err(e) => error!("Send task did not complete: {}", e),
                }
            }
            reports
        };

        let reports = match deadline {
            Some(limit) => tokio::time::timeout(limit, drain)
                .await
                .map_err(|_| SamplerError::SendPhaseTimeout(limit))?,
            None => drain.await,
        };

        Ok(SendPhaseSummary {
            tasks: reports,
            elapsed: started.elapsed(),
        })
    }
}
