use clap::Parser;
use telemetry_flows::cli::{self, Cli, CliContext};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let context = CliContext::new(cli.config);
    let command = cli.command.unwrap_or_else(cli::default_command);
    cli::execute(&context, command).await
}
