use std::{path::PathBuf, sync::Arc};

use anyhow::bail;
use chrono::Utc;
use clap::{Args, Subcommand};
use flow_api::Message;

use super::CliContext;
use crate::{
    broker::MemoryBroker,
    config::EngineConfig,
    dispatcher::{Dispatcher, ProcessReport},
    executor::Executor,
    flow::{FlowDefinition, FlowRegistry, file::load_flow_file},
    logger::{LogConfig, MemoryLogger, init_tracing},
    state::Store,
};

#[derive(Args, Debug)]
pub struct FlowArgs {
    #[command(subcommand)]
    pub command: FlowCommands,
}

#[derive(Subcommand, Debug)]
pub enum FlowCommands {
    /// Parse a flow file and compile its transform
    Validate { file: PathBuf },
    /// Run one message through a single flow and print what it publishes
    Test {
        file: PathBuf,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value = "")]
        payload: String,
        #[arg(long)]
        retain: bool,
    },
    /// Fire the interval entry point of a flow once
    Tick { file: PathBuf },
}

pub async fn execute(args: FlowArgs, context: &CliContext) -> anyhow::Result<()> {
    let config = context.load_config()?;
    let _guard = init_tracing(&LogConfig::new(config.log_level, None, false))?;
    let env = config.prepare_env();

    match args.command {
        FlowCommands::Validate { file } => {
            let definition = load_flow_file(&file, &env)?;
            let topics: Vec<&str> = definition.topics().iter().map(|t| t.as_str()).collect();
            println!("✅ Flow `{}` is valid (topics: {}).", definition.id(), topics.join(", "));
            Ok(())
        }
        FlowCommands::Test {
            file,
            topic,
            payload,
            retain,
        } => {
            let definition = load_flow_file(&file, &env)?;
            let (dispatcher, broker, logs) = single_flow(definition, &config)?;
            let report = dispatcher
                .process(Message::new(topic, payload).with_retain(retain))
                .await;
            print_outcome(&report, &broker, &logs)
        }
        FlowCommands::Tick { file } => {
            let definition = load_flow_file(&file, &env)?;
            if definition.interval().is_none() {
                println!("Flow `{}` declares no interval_secs, ticking anyway.", definition.id());
            }
            let (dispatcher, broker, logs) = single_flow(definition, &config)?;
            let Some(definition) = dispatcher.registry().all().into_iter().next() else {
                bail!("flow was not registered");
            };
            let report = dispatcher.tick(&definition, Utc::now()).await;
            print_outcome(&report, &broker, &logs)
        }
    }
}

fn single_flow(
    definition: FlowDefinition,
    config: &EngineConfig,
) -> anyhow::Result<(Dispatcher, Arc<MemoryBroker>, Arc<MemoryLogger>)> {
    let registry = FlowRegistry::new(Store::new());
    registry.register(definition)?;
    let broker = Arc::new(MemoryBroker::new());
    let logs = MemoryLogger::new();
    let dispatcher = Dispatcher::new(
        registry,
        Executor::new(config.invocation_timeout()),
        broker.clone(),
        logs.clone(),
    )
    .with_default_qos(config.default_qos);
    Ok((dispatcher, broker, logs))
}

fn print_outcome(report: &ProcessReport, broker: &MemoryBroker, logs: &MemoryLogger) -> anyhow::Result<()> {
    for line in logs.lines() {
        eprintln!("[{:?}] {}: {}", line.level, line.flow, line.message);
    }
    for message in broker.published() {
        println!("{}", serde_json::to_string(&message)?);
    }
    eprintln!(
        "published {}, dropped {}, failed {}",
        report.published, report.dropped, report.failed
    );
    if report.failed > 0 {
        bail!("flow invocation failed");
    }
    Ok(())
}
