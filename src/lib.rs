//! # SMTP Sampler Library
//!
//! A load generator and latency sampler for SMTP servers. A run pushes a fixed
//! number of messages through a bounded pool of concurrent SMTP sessions and
//! reports timing statistics for every phase of the exchange.
//!
//! ## Measured Phases
//!
//! - **Connection setup**: TCP connect, greeting, EHLO and optional STARTTLS/AUTH
//! - **Connection handling**: session time not spent stamping or sending messages
//! - **Message send**: `MAIL FROM` through the final reply to the terminating dot
//! - **Message receive**: DATA transfer time observed by the inbound listener
//! - **Round trip**: time from acceptance by the server until the message
//!   arrives back at the inbound listener
//!
//! Each category keeps a numerically stable running mean and variance, a
//! Student's-t confidence interval and HDR histogram percentiles.
//!
//! ## Architecture Overview
//!
//! - `scheduler`: splits the workload into per-connection batches and runs them
//!   with bounded concurrency
//! - `task`: one connection's lifecycle and its per-message timing
//! - `transport`: the SMTP client, the inbound listener and the STARTTLS glue
//! - `correlation`: send/receive timestamp tables and round-trip joining
//! - `metrics`: running statistics, confidence intervals and counters
//! - `results`: the final report in text and JSON form
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use smtp_sampler::{Endpoint, Sampler, SamplerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SamplerConfig {
//!         endpoint: Endpoint::new("mail.example.com", 25),
//!         messages: 1000,
//!         connections: 10,
//!         messages_per_connection: 10,
//!         ..SamplerConfig::default()
//!     };
//!     let template = config.load_message()?;
//!
//!     let report = Sampler::new(config, template).run().await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

/// Command-line interface
pub mod cli;

/// Shared per-run state handed to every send task
pub mod context;

/// Send/receive timestamp tables and round-trip correlation
pub mod correlation;

pub mod error;

/// Message and connection identifiers
pub mod ids;

/// Async countdown latch used to await outstanding deliveries
pub mod latch;

pub mod logging;

/// Test message generation, parsing and header stamping
pub mod message;

/// Running statistics, confidence intervals and run counters
///
/// Every timing category is accumulated concurrently by all send tasks and
/// the inbound listener. Provides:
/// - Welford mean and variance with a Student's-t confidence interval
/// - HDR histogram percentiles (P50, P95, P99)
/// - Throughput on wall time and on accumulated busy time
pub mod metrics;

/// Report assembly and output formatting
pub mod results;

/// Run orchestration: listener, send phase, receive phase, report
pub mod sampler;

/// Workload partitioning and the bounded-concurrency send phase
pub mod scheduler;

/// Per-connection send task
pub mod task;

/// SMTP client, inbound SMTP listener and the transport abstraction
///
/// The `MailTransport` and `MailConnection` traits decouple the send tasks
/// from the wire protocol so tests can substitute scripted transports.
pub mod transport;

pub mod utils;

pub use cli::Args;
pub use error::{ConfigError, SamplerError};
pub use message::{Envelope, MessageTemplate};
pub use metrics::{CategoryStatistics, RunningStatistics, Statistics, TimingCategory};
pub use results::RunReport;
pub use sampler::{ListenConfig, MessageSource, Sampler, SamplerConfig};
pub use transport::{Credentials, Endpoint, MailConnection, MailTransport, TransportConfig};

/// The current version of the sampler
///
/// Populated from Cargo.toml and recorded in the report metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    pub const HOST: &str = "localhost";
    pub const PORT: u16 = 25;
    pub const HELO_NAME: &str = "localhost";

    pub const SUBJECT: &str = "test";

    /// Body size of the generated message in bytes
    pub const MESSAGE_SIZE: usize = 10;
    pub const FROM: &str = "from@localhost";
    pub const TO: &str = "to@localhost";

    pub const MESSAGES: usize = 1;
    pub const MESSAGES_PER_CONNECTION: usize = 1;
    pub const CONNECTIONS: usize = 1;

    pub const LISTEN_HOST: &str = "localhost";
    pub const LISTEN_PORT: u16 = 2525;

    /// Header stamped into every outgoing message to correlate deliveries
    pub const HEADER_NAME: &str = "X-BENCHMARK-MESSAGE-ID";

    /// Significance level of the reported confidence intervals (95%)
    pub const SIGNIFICANCE: f64 = 0.05;

    /// Receive deadline used when no overall timeout is set
    pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Upper bound for any single network step
    pub const IO_TIMEOUT: Duration = Duration::from_secs(30);
}
