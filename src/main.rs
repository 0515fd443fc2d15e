//! ashep CLI entry point: parse arguments, initialize logging, route the
//! command, map errors to exit codes.

use clap::Parser;

use ashep::app::init_logging;
use ashep::cli::{execute_command, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = execute_command(cli).await {
        tracing::error!("{e}");
        std::process::exit(e.exit_code());
    }
}
