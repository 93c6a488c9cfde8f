//! Error taxonomy for a sampler run.
//!
//! Failures fall into three groups, and each group is handled at a different level:
//!
//! - [`ConfigError`]: detected before any work starts; always fatal.
//! - [`crate::transport::TransportError`]: per-connection or per-message faults;
//!   recorded by the send task and never propagated past it.
//! - [`SamplerError`]: run-level failures surfaced to the caller (configuration,
//!   client or listener setup failure, send phase not finished in time).

use std::time::Duration;
use thiserror::Error;

use crate::transport::{SmtpError, TransportError};

/// Invalid run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("message count must be greater than zero")]
    NoMessages,

    #[error("number of connections must be greater than zero")]
    NoConnections,

    #[error("messages per connection must be greater than zero")]
    NoMessagesPerConnection,

    #[error("message count ({messages}) is lower than the number of connections ({connections})")]
    FewerMessagesThanConnections { messages: usize, connections: usize },

    #[error("username is required with --auth")]
    MissingUsername,

    #[error("significance level must be in (0, 1), got {0}")]
    InvalidSignificance(f64),

    #[error("header name {0:?} is not a valid message header name")]
    InvalidHeaderName(String),

    #[error("cannot read message file {path}: {source}")]
    MessageFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("message has no envelope {0}")]
    MissingEnvelope(&'static str),
}

/// Run-level failure that aborts the sampler before a report is produced.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot start inbound listener: {0}")]
    Listener(#[source] TransportError),

    #[error("cannot initialise SMTP client: {0}")]
    Transport(#[from] SmtpError),

    #[error("Test not finished in time (timeout {0:?})")]
    SendPhaseTimeout(Duration),

    #[error("cannot allocate latency histogram: {0}")]
    Statistics(#[from] hdrhistogram::CreationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::FewerMessagesThanConnections {
            messages: 2,
            connections: 5,
        };
        assert_eq!(
            err.to_string(),
            "message count (2) is lower than the number of connections (5)"
        );
        assert_eq!(
            ConfigError::MissingUsername.to_string(),
            "username is required with --auth"
        );
    }

    #[test]
    fn test_sampler_error_wraps_config() {
        let err: SamplerError = ConfigError::NoConnections.into();
        assert!(matches!(err, SamplerError::Config(ConfigError::NoConnections)));
        assert_eq!(
            err.to_string(),
            "number of connections must be greater than zero"
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = SamplerError::SendPhaseTimeout(Duration::from_secs(3));
        assert!(err.to_string().starts_with("Test not finished in time"));
    }
}
