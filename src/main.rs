mod cli;

use clap::Parser;
use templar::errors::TemplarError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    // Results go to stdout; keep logs on stderr.
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(!cli.no_color)
            .with_writer(std::io::stderr)
            .init();
    }

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("BUILD_TIMESTAMP"),
        git = option_env!("GIT_HASH").unwrap_or("unknown"),
        "templar starting"
    );

    let result = match cli.command {
        cli::Commands::Scan(args) => cli::scan::handle_scan(args).await,
        cli::Commands::Validate(args) => cli::validate::handle_validate(args).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        let exit_code = match e.downcast_ref::<TemplarError>() {
            Some(TemplarError::Config(_)) | Some(TemplarError::Yaml(_)) => 2,
            Some(TemplarError::Compile(_)) | Some(TemplarError::Template(_)) => 3,
            Some(TemplarError::Sandbox(_)) => 4,
            Some(TemplarError::Cancelled(_)) => 130,
            _ => 1,
        };
        std::process::exit(exit_code);
    }
}
