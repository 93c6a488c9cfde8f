use clap::{CommandFactory, Parser};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::defaults;

/// SMTP Sampler - load generator and latency sampler for SMTP servers
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// SMTP server hostname or IP address
    #[clap(short = 'H', long, default_value = defaults::HOST, help_heading = "Connection")]
    pub host: String,

    /// SMTP server port
    #[clap(short = 'p', long, default_value_t = defaults::PORT, help_heading = "Connection")]
    pub port: u16,

    /// Username for AUTH
    #[clap(short = 'u', long, default_value = "", help_heading = "Connection")]
    pub username: String,

    /// Password for AUTH
    #[clap(long, default_value = "", help_heading = "Connection")]
    pub password: String,

    /// Use authentication
    #[clap(short = 'a', long, default_value_t = false, help_heading = "Connection")]
    pub auth: bool,

    /// Use STARTTLS (server certificates are not verified)
    #[clap(long, default_value_t = false, help_heading = "Connection")]
    pub starttls: bool,

    /// Name announced in EHLO/HELO
    #[clap(long, default_value = defaults::HELO_NAME, help_heading = "Connection")]
    pub helo_name: String,

    /// Use file as message and do not generate a test message
    #[clap(short = 'F', long, help_heading = "Message")]
    pub file: Option<PathBuf>,

    /// Subject of the generated message
    #[clap(short = 's', long, default_value = defaults::SUBJECT, help_heading = "Message")]
    pub subject: String,

    /// Size of the body of the generated message in bytes
    #[clap(long, default_value_t = defaults::MESSAGE_SIZE, help_heading = "Message")]
    pub message_size: usize,

    /// Value for the From header of the generated message
    #[clap(short = 'f', long, default_value = defaults::FROM, help_heading = "Message")]
    pub from: String,

    /// Value for the To header of the generated message
    #[clap(short = 't', long, default_value = defaults::TO, help_heading = "Message")]
    pub to: String,

    /// Total number of messages
    #[clap(short = 'n', long, default_value_t = defaults::MESSAGES, help_heading = "Load")]
    pub messages: usize,

    /// Maximum number of messages sent over one connection
    #[clap(long, default_value_t = defaults::MESSAGES_PER_CONNECTION, help_heading = "Load")]
    pub messages_per_connection: usize,

    /// Number of concurrent connections
    #[clap(short = 'c', long, default_value_t = defaults::CONNECTIONS, help_heading = "Load")]
    pub connections: usize,

    /// Max time for the send phase (e.g. 30s, 5m); 0 means forever
    #[clap(long, default_value = "0", value_parser = parse_duration, help_heading = "Timing")]
    pub timeout: Duration,

    /// Upper bound for every single network operation
    #[clap(long, default_value = "30s", value_parser = parse_duration, help_heading = "Timing")]
    pub io_timeout: Duration,

    /// Start an inbound SMTP listener and measure round-trip time
    #[clap(long, default_value_t = false, help_heading = "Round trip")]
    pub listen: bool,

    /// Address the inbound listener binds to
    #[clap(long, default_value = defaults::LISTEN_HOST, help_heading = "Round trip")]
    pub listen_host: String,

    /// Port the inbound listener binds to
    #[clap(long, default_value_t = defaults::LISTEN_PORT, help_heading = "Round trip")]
    pub listen_port: u16,

    /// How long to wait for deliveries when no --timeout is set
    #[clap(long, default_value = "30s", value_parser = parse_duration, help_heading = "Round trip")]
    pub receive_timeout: Duration,

    /// Header carrying the message identifier
    #[clap(long, default_value = defaults::HEADER_NAME, help_heading = "Round trip")]
    pub header_name: String,

    /// Significance level for confidence intervals
    #[clap(long, default_value_t = defaults::SIGNIFICANCE, help_heading = "Output")]
    pub significance: f64,

    /// Write the report as JSON to this file
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// Also write log output to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false, help_heading = "Output")]
    pub verbose: bool,
}

/// True when the command line holds nothing but the program name.
///
/// Such a run prints [`usage`] and exits successfully instead of sampling
/// `localhost` with every default.
pub fn usage_requested<I, T>(argv: I) -> bool
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    argv.into_iter().nth(1).is_none()
}

/// Full help text
pub fn usage() -> String {
    Args::command().render_help().to_string()
}

/// Parse duration from string (e.g., "10s", "5m", "1h", "250ms")
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let seconds = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("Invalid duration {}: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["smtp-sampler", "-n", "10"]);
        assert_eq!(args.host, "localhost");
        assert_eq!(args.port, 25);
        assert_eq!(args.messages, 10);
        assert_eq!(args.connections, 1);
        assert_eq!(args.messages_per_connection, 1);
        assert_eq!(args.timeout, Duration::ZERO);
        assert_eq!(args.header_name, "X-BENCHMARK-MESSAGE-ID");
        assert_eq!(args.from, "from@localhost");
        assert_eq!(args.to, "to@localhost");
        assert!(!args.listen);
    }

    #[test]
    fn test_full_command_line() {
        let args = Args::parse_from([
            "smtp-sampler",
            "-H",
            "mx.example.com",
            "-p",
            "587",
            "-a",
            "-u",
            "bench",
            "--password",
            "secret",
            "--starttls",
            "-n",
            "100",
            "-c",
            "10",
            "--messages-per-connection",
            "5",
            "--timeout",
            "2m",
            "--listen",
            "--listen-port",
            "2626",
            "-v",
        ]);
        assert_eq!(args.host, "mx.example.com");
        assert_eq!(args.port, 587);
        assert!(args.auth && args.starttls && args.listen && args.verbose);
        assert_eq!(args.username, "bench");
        assert_eq!(args.timeout, Duration::from_secs(120));
        assert_eq!(args.listen_port, 2626);
    }

    #[test]
    fn test_no_arguments_prints_help() {
        assert!(usage_requested(["smtp-sampler"]));
        assert!(!usage_requested(["smtp-sampler", "-n", "5"]));
        assert!(!usage_requested(["smtp-sampler", "--listen"]));

        let help = usage();
        assert!(help.contains("--messages"));
        assert!(help.contains("--listen"));

        // Defaults alone still parse, so nothing is reported as an error
        let args = Args::try_parse_from(["smtp-sampler"]).unwrap();
        assert_eq!(args.messages, 1);
    }
}
