use clap::Parser;
use tracing_subscriber::EnvFilter;

use tally::commands::Commands;
use tally::runtime::MetricsRuntime;

/// Aggregate counters into daily and hourly buckets
#[derive(Parser, Debug)]
#[command(name = "tally", version, about)]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("TALLY_LOG")
                .unwrap_or_else(|_| EnvFilter::default().add_directive(default_level.into())),
        )
        .init();

    let runtime = match MetricsRuntime::load() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = cli.command.run(&runtime) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
