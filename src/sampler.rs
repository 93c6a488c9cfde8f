//! # Sampler Run Orchestration
//!
//! [`SamplerConfig`] is the validated, run-scoped configuration; [`Sampler`]
//! executes one run with it:
//!
//! 1. **Listener**: when round-trip measurement is enabled, the inbound
//!    listener is bound before anything is sent so no delivery can be missed.
//! 2. **Send phase**: the [`ConnectionScheduler`] runs every batch. If the
//!    overall timeout elapses first, the run aborts with
//!    [`SamplerError::SendPhaseTimeout`] and no report is produced.
//! 3. **Receive phase**: the run waits for outstanding deliveries with
//!    whatever remains of the overall timeout (or `receive_timeout` when no
//!    overall timeout is set). Running out of time here is not fatal.
//! 4. **Report**: send and receive tables are joined into round-trip samples
//!    and every accumulator is snapshotted into a [`RunReport`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cli::Args;
use crate::context::RunContext;
use crate::correlation::{correlate, ReceiveCorrelator};
use crate::error::{ConfigError, SamplerError};
use crate::message::{is_valid_header_name, MessageTemplate};
use crate::results::{ConfigurationSummary, ReceivePhaseSummary, RunReport};
use crate::scheduler::{plan_batches, ConnectionScheduler};
use crate::transport::{
    Credentials, Endpoint, MailTransport, SmtpListener, SmtpTransport, TransportConfig,
};

/// Where the inbound listener binds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

/// How the test message is obtained
#[derive(Debug, Clone)]
pub enum MessageSource {
    File(PathBuf),
    Generated {
        subject: String,
        from: String,
        to: String,
        size: usize,
    },
}

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub endpoint: Endpoint,
    /// Present only when authentication was requested
    pub credentials: Option<Credentials>,
    pub transport: TransportConfig,
    pub message: MessageSource,

    pub messages: usize,
    pub messages_per_connection: usize,
    pub connections: usize,

    /// Bound for the whole run; `None` waits forever for the send phase
    pub timeout: Option<Duration>,
    /// Round-trip measurement is enabled when set
    pub listen: Option<ListenConfig>,
    /// Receive deadline used when `timeout` is `None`
    pub receive_timeout: Duration,

    pub header_name: String,
    pub significance: f64,
    pub verbose: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new(crate::defaults::HOST, crate::defaults::PORT),
            credentials: None,
            transport: TransportConfig::default(),
            message: MessageSource::Generated {
                subject: crate::defaults::SUBJECT.to_string(),
                from: crate::defaults::FROM.to_string(),
                to: crate::defaults::TO.to_string(),
                size: crate::defaults::MESSAGE_SIZE,
            },
            messages: crate::defaults::MESSAGES,
            messages_per_connection: crate::defaults::MESSAGES_PER_CONNECTION,
            connections: crate::defaults::CONNECTIONS,
            timeout: None,
            listen: None,
            receive_timeout: crate::defaults::RECEIVE_TIMEOUT,
            header_name: crate::defaults::HEADER_NAME.to_string(),
            significance: crate::defaults::SIGNIFICANCE,
            verbose: false,
        }
    }
}

impl SamplerConfig {
    /// Build and validate the run configuration from command line arguments
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let credentials = if args.auth {
            if args.username.trim().is_empty() {
                return Err(ConfigError::MissingUsername);
            }
            Some(Credentials {
                username: args.username.clone(),
                password: args.password.clone(),
            })
        } else {
            None
        };

        let message = match &args.file {
            Some(path) => MessageSource::File(path.clone()),
            None => MessageSource::Generated {
                subject: args.subject.clone(),
                from: args.from.clone(),
                to: args.to.clone(),
                size: args.message_size,
            },
        };

        let config = Self {
            endpoint: Endpoint::new(args.host.clone(), args.port),
            credentials,
            transport: TransportConfig {
                starttls: args.starttls,
                helo_name: args.helo_name.clone(),
                io_timeout: args.io_timeout,
            },
            message,
            messages: args.messages,
            messages_per_connection: args.messages_per_connection,
            connections: args.connections,
            timeout: (!args.timeout.is_zero()).then_some(args.timeout),
            listen: args.listen.then(|| ListenConfig {
                host: args.listen_host.clone(),
                port: args.listen_port,
            }),
            receive_timeout: args.receive_timeout,
            header_name: args.header_name.clone(),
            significance: args.significance,
            verbose: args.verbose,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        plan_batches(
            self.messages,
            self.connections,
            self.messages_per_connection,
        )?;
        if !(self.significance > 0.0 && self.significance < 1.0) {
            return Err(ConfigError::InvalidSignificance(self.significance));
        }
        if !is_valid_header_name(&self.header_name) {
            return Err(ConfigError::InvalidHeaderName(self.header_name.clone()));
        }
        if let Some(credentials) = &self.credentials {
            if credentials.username.trim().is_empty() {
                return Err(ConfigError::MissingUsername);
            }
        }
        Ok(())
    }

    /// Generate the test message or read it from disk
    pub fn load_message(&self) -> Result<MessageTemplate, ConfigError> {
        match &self.message {
            MessageSource::File(path) => MessageTemplate::from_file(path),
            MessageSource::Generated {
                subject,
                from,
                to,
                size,
            } => Ok(MessageTemplate::generate(subject, from, to, *size)),
        }
    }

    fn summary(&self, batches: usize) -> ConfigurationSummary {
        ConfigurationSummary {
            endpoint: self.endpoint.to_string(),
            starttls: self.transport.starttls,
            auth: self.credentials.is_some(),
            messages: self.messages,
            connections: self.connections,
            messages_per_connection: self.messages_per_connection,
            batches,
            timeout: self.timeout,
            listener: self
                .listen
                .as_ref()
                .map(|l| format!("{}:{}", l.host, l.port)),
            header_name: self.header_name.clone(),
            significance: self.significance,
        }
    }
}

/// Options banner printed in verbose mode; the password is masked
pub struct SamplerConfigDisplay<'a>(pub &'a SamplerConfig);

impl fmt::Display for SamplerConfigDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.0;
        writeln!(f, "Options:")?;
        writeln!(f, "\thost: {}", config.endpoint.host)?;
        writeln!(f, "\tport: {}", config.endpoint.port)?;
        writeln!(f, "\tstarttls: {}", config.transport.starttls)?;
        writeln!(f, "\tauth: {}", config.credentials.is_some())?;
        if let Some(credentials) = &config.credentials {
            writeln!(f, "\tusername: {}", credentials.username)?;
            writeln!(f, "\tpassword: ***")?;
        }
        match &config.message {
            MessageSource::File(path) => writeln!(f, "\tfile: {}", path.display())?,
            MessageSource::Generated {
                subject,
                from,
                to,
                size,
            } => {
                writeln!(f, "\tsubject: {}", subject)?;
                writeln!(f, "\tmessagesize: {} (bytes)", size)?;
                writeln!(f, "\tfrom: {}", from)?;
                writeln!(f, "\tto: {}", to)?;
            }
        }
        writeln!(f, "\tmessages: {}", config.messages)?;
        writeln!(
            f,
            "\tmessages per connection: {}",
            config.messages_per_connection
        )?;
        writeln!(f, "\tconnections: {}", config.connections)?;
        match config.timeout {
            Some(timeout) => writeln!(f, "\ttimeout: {:?}", timeout)?,
            None => writeln!(f, "\ttimeout: forever")?,
        }
        writeln!(f, "\tio timeout: {:?}", config.transport.io_timeout)?;
        match &config.listen {
            Some(listen) => writeln!(f, "\tlisten: {}:{}", listen.host, listen.port)?,
            None => writeln!(f, "\tlisten: false")?,
        }
        writeln!(f, "\theader: {}", config.header_name)?;
        write!(f, "\tverbose: {}", config.verbose)
    }
}

/// One sampler run
pub struct Sampler {
    config: SamplerConfig,
    template: MessageTemplate,
    transport: Option<Arc<dyn MailTransport>>,
}

impl Sampler {
    pub fn new(config: SamplerConfig, template: MessageTemplate) -> Self {
        Self {
            config,
            template,
            transport: None,
        }
    }

    /// Send through `transport` instead of the built-in SMTP client
    pub fn with_transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<RunReport, SamplerError> {
        let config = &self.config;
        config.validate()?;
        let batches = plan_batches(
            config.messages,
            config.connections,
            config.messages_per_connection,
        )?;
        let envelope = self.template.envelope()?;

        let transport: Arc<dyn MailTransport> = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(SmtpTransport::new(config.transport.clone())?),
        };

        let context = Arc::new(RunContext::new(
            config.endpoint.clone(),
            config.credentials.clone(),
            config.header_name.clone(),
            config.verbose,
        )?);

        let receiver = match &config.listen {
            Some(listen) => {
                let correlator = Arc::new(ReceiveCorrelator::new(
                    config.messages,
                    context.statistics.clone(),
                    context.counters.clone(),
                ));
                let listener = SmtpListener::bind(
                    &listen.host,
                    listen.port,
                    &config.header_name,
                    correlator.clone(),
                )
                .await
                .map_err(SamplerError::Listener)?;
                info!("Listening for deliveries on {}", listener.local_addr());
                Some((correlator, listener))
            }
            None => None,
        };

        let started = Instant::now();
        info!(
            "Sending {} messages to {} in {} batches",
            config.messages,
            config.endpoint,
            batches.len()
        );

        let scheduler =
            ConnectionScheduler::new(config.connections, transport, context.clone());
        let send_phase = scheduler
            .run(&batches, &self.template, &envelope, config.timeout)
            .await?;
        debug!(
            "Send phase finished in {:?} ({} tasks)",
            send_phase.elapsed,
            send_phase.tasks.len()
        );

        let mut receive_phase = None;
        let mut correlation = None;
        if let Some((correlator, listener)) = receiver {
            let deadline = match config.timeout {
                Some(total) => total.saturating_sub(started.elapsed()),
                None => config.receive_timeout,
            };
            let receive_started = Instant::now();
            let completed = correlator.await_all(deadline).await;
            let outstanding = correlator.outstanding();
            if !completed {
                warn!(
                    "{} messages not received within {:?}",
                    outstanding, deadline
                );
            }
            listener.shutdown();

            receive_phase = Some(ReceivePhaseSummary {
                completed,
                deadline,
                elapsed: receive_started.elapsed(),
                outstanding,
            });
            correlation = Some(correlate(
                &context.sent,
                correlator.received(),
                &context.statistics,
            ));
        }

        let wall_time = started.elapsed();
        Ok(RunReport::new(
            config.summary(batches.len()),
            &context.statistics,
            context.counters.snapshot(),
            wall_time,
            send_phase.elapsed,
            receive_phase,
            correlation,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_from_args() {
        let args = Args::parse_from([
            "smtp-sampler",
            "-n",
            "10",
            "-c",
            "3",
            "--messages-per-connection",
            "5",
            "--timeout",
            "30s",
            "--listen",
        ]);
        let config = SamplerConfig::from_args(&args).unwrap();
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            config.listen,
            Some(ListenConfig {
                host: "localhost".to_string(),
                port: 2525
            })
        );
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_zero_timeout_means_forever() {
        let args = Args::parse_from(["smtp-sampler", "-n", "1"]);
        let config = SamplerConfig::from_args(&args).unwrap();
        assert_eq!(config.timeout, None);
        assert!(config.listen.is_none());
    }

    #[test]
    fn test_auth_requires_username() {
        let args = Args::parse_from(["smtp-sampler", "-a", "--password", "x"]);
        assert!(matches!(
            SamplerConfig::from_args(&args),
            Err(ConfigError::MissingUsername)
        ));

        // Credentials are ignored without --auth
        let args = Args::parse_from(["smtp-sampler", "-u", "someone"]);
        assert!(SamplerConfig::from_args(&args)
            .unwrap()
            .credentials
            .is_none());
    }

    #[test]
    fn test_rejects_more_connections_than_messages() {
        let args = Args::parse_from(["smtp-sampler", "-n", "2", "-c", "5"]);
        assert!(matches!(
            SamplerConfig::from_args(&args),
            Err(ConfigError::FewerMessagesThanConnections { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_significance_and_header() {
        let config = SamplerConfig {
            significance: 1.5,
            ..SamplerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSignificance(_))
        ));

        let config = SamplerConfig {
            header_name: "Bad Header".to_string(),
            ..SamplerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHeaderName(_))
        ));
    }

    #[test]
    fn test_banner_masks_password() {
        let config = SamplerConfig {
            credentials: Some(Credentials {
                username: "bench".to_string(),
                password: "hunter2".to_string(),
            }),
            ..SamplerConfig::default()
        };
        let banner = SamplerConfigDisplay(&config).to_string();
        assert!(banner.contains("username: bench"));
        assert!(!banner.contains("hunter2"));
        assert!(banner.contains("timeout: forever"));
    }

    #[test]
    fn test_load_generated_message() {
        let config = SamplerConfig::default();
        let message = config.load_message().unwrap();
        assert_eq!(message.header("From"), Some("from@localhost"));
        assert_eq!(message.body().trim_end().len(), 10);
    }
}
