//! iothub CLI

use clap::Parser;

use iothub::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    iothub_common::telemetry::init_telemetry(cli.global.telemetry())?;
    cli.run().await
}
