use anyhow::Result;
use clap::Parser;

use fanout::commands::Cli;
use fanout::common::configure_logging;
use fanout::task::builtin_registry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_logging(cli.verbose);
    cli.run(builtin_registry()).await
}
