//! # SMTP Sampler - Main Entry Point
//!
//! The main function performs these key operations:
//! 1. **Parse arguments**: processes the command-line configuration; with no
//!    arguments at all the help text is printed and the process exits with 0
//! 2. **Initialize logging**: colorized console output, optionally mirrored to a file
//! 3. **Build the run configuration**: validates the options and loads the test message
//! 4. **Run the sampler**: send phase, optional receive phase, correlation
//! 5. **Report**: prints the text report and optionally writes it as JSON
//!
//! ## Error Handling
//!
//! Any failure before a report exists (bad options, unreadable message file,
//! listener bind failure, send phase timeout) is printed as
//! `Fatal error: <cause chain>` and the process exits with status 1.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use smtp_sampler::{
    cli::{self, Args},
    logging,
    sampler::{Sampler, SamplerConfig, SamplerConfigDisplay},
};
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    if cli::usage_requested(std::env::args_os()) {
        println!("{}", cli::usage());
        return ExitCode::SUCCESS;
    }
    let args = Args::parse();

    // Held until exit so the file writer flushes
    let _guard = match logging::init(args.verbose, args.log_file.as_deref())
        .context("cannot initialise logging")
    {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Fatal error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Fatal error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = SamplerConfig::from_args(&args)?;
    if config.verbose {
        info!("{}", SamplerConfigDisplay(&config));
    }

    let template = config
        .load_message()
        .context("cannot prepare the test message")?;
    let report = Sampler::new(config, template).run().await?;

    println!("{}", report);

    if let Some(path) = &args.output_file {
        report.write_json(path)?;
    }
    Ok(())
}
