use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

pub mod flow;
pub mod run;
pub mod schema;

use flow::FlowArgs;
use run::RunArgs;
use schema::SchemaArgs;

use crate::config::EngineConfig;

#[derive(Parser, Debug)]
#[command(
    name = "telemetry-flows",
    about = "Route device telemetry through flows and republish the results",
    version
)]
pub struct Cli {
    /// Engine configuration (YAML, or JSON when it ends in `.json`)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine on JSON lines read from stdin
    Run(RunArgs),

    /// Emit the JSON-Schema of the engine configuration
    Schema(SchemaArgs),

    /// Check or try out a single flow file
    Flow(FlowArgs),
}

#[derive(Debug, Clone, Default)]
pub struct CliContext {
    pub config_path: Option<PathBuf>,
}

impl CliContext {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self { config_path }
    }

    /// The configuration file (or defaults) with environment overrides applied.
    pub fn load_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config_path {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => EngineConfig::default(),
        };
        config.apply_env()?;
        Ok(config)
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
        Commands::Flow(args) => flow::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
