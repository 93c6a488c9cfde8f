//! Run-scoped shared state.
//!
//! A [`RunContext`] is created at the start of a run and handed by `Arc` to every
//! send task. It is the only state the tasks share: identifier generators, the
//! statistics accumulators, the event counters and the send-time table. Nothing
//! here outlives the run that created it.

use std::sync::Arc;

use crate::correlation::TimestampTable;
use crate::error::SamplerError;
use crate::ids::{ConnectionId, IdGenerator, MessageId};
use crate::metrics::{RunCounters, Statistics};
use crate::transport::{Credentials, Endpoint};

pub struct RunContext {
    message_ids: IdGenerator,
    connection_ids: IdGenerator,
    pub statistics: Arc<Statistics>,
    pub counters: Arc<RunCounters>,
    /// Instant each message finished sending, by identifier
    pub sent: TimestampTable,
    /// Correlation header stamped into every message
    pub header_name: String,
    pub endpoint: Endpoint,
    pub credentials: Option<Credentials>,
    /// Log every message and failed connection
    pub verbose: bool,
}

impl RunContext {
    pub fn new(
        endpoint: Endpoint,
        credentials: Option<Credentials>,
        header_name: impl Into<String>,
        verbose: bool,
    ) -> Result<Self, SamplerError> {
        Ok(Self {
            message_ids: IdGenerator::new(1),
            connection_ids: IdGenerator::new(1),
            statistics: Arc::new(Statistics::new()?),
            counters: Arc::new(RunCounters::default()),
            sent: TimestampTable::new(),
            header_name: header_name.into(),
            endpoint,
            credentials,
            verbose,
        })
    }

    pub fn next_message_id(&self) -> MessageId {
        self.message_ids.next()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.connection_ids.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_start_at_one() {
        let context =
            RunContext::new(Endpoint::new("localhost", 25), None, "X-Id", false).unwrap();
        assert_eq!(context.next_message_id(), 1);
        assert_eq!(context.next_message_id(), 2);
        assert_eq!(context.next_connection_id(), 1);
        assert!(context.sent.is_empty());
    }
}
