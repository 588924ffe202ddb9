use anyhow::Result;
use clap::Parser;

use runner_setup::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    runner_core::tracing_init::init_tracing("runner=info", false);

    let cli = Cli::parse();
    cli.run().await
}
