//! docqueue CLI: dependency-ordered task queues for document automation.

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = docqueue::cli::Cli::parse();

    let default_filter = if cli.verbose {
        "docqueue=debug"
    } else {
        "docqueue=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = docqueue::cli::dispatch(cli) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
