use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Args;
use flow_api::Message;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal,
};
use tracing::{error, info, warn};

use super::CliContext;
use crate::{
    broker::StdoutBroker,
    config::EngineConfig,
    dispatcher::Dispatcher,
    executor::Executor,
    flow::{
        FlowRegistry, PrepareEnv,
        file::{flow_files_in, load_flow_file},
    },
    logger::{TracingLogger, init_tracing},
    runtime::Runtime,
    state::{JsonFileState, Store},
    watcher::FlowDirWatcher,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,

    /// How long queued messages may take to drain on shutdown, in milliseconds
    #[arg(long, default_value = "5000")]
    pub drain_timeout_ms: u64,

    /// Poll interval of the flow directory watcher, in milliseconds
    #[arg(long, default_value = "1000")]
    pub watch_interval_ms: u64,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            log_level: None,
            drain_timeout_ms: 5000,
            watch_interval_ms: 1000,
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let mut config = context.load_config()?;
    if let Some(level) = &args.log_level {
        config.log_level = level.parse().map_err(anyhow::Error::msg)?;
    }
    let _guard = init_tracing(&config.log_config())?;
    run_engine(config, args).await
}

async fn run_engine(mut config: EngineConfig, args: RunArgs) -> anyhow::Result<()> {
    let store = match &config.mapper_state_path {
        Some(path) => Store::with_persistence(JsonFileState::new(path.clone())),
        None => Store::new(),
    };
    let registry = FlowRegistry::new(store);
    for definition in config.take_inline_flows()? {
        registry
            .register(definition)
            .context("failed to register inline flow")?;
    }

    let dispatcher = Dispatcher::new(
        registry.clone(),
        Executor::new(config.invocation_timeout()),
        Arc::new(StdoutBroker::new()),
        TracingLogger::new(),
    )
    .with_default_qos(config.default_qos);
    let runtime = Runtime::new(Arc::new(dispatcher), config.runtime_options());
    runtime.start().await?;

    let env = config.prepare_env();
    let watcher = match &config.flows_dir {
        Some(dir) if config.watch_flows => Some(
            FlowDirWatcher::new(registry.clone(), env)
                .watch(dir.clone(), Duration::from_millis(args.watch_interval_ms))
                .await?,
        ),
        Some(dir) => {
            load_flow_dir(&registry, dir, &env)?;
            None
        }
        None => None,
    };
    if registry.is_empty() {
        warn!("no flow registered, inbound messages will be dropped");
    }
    info!(flows = ?registry.ids(), "engine ready, reading messages from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => submit_line(&runtime, &line),
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(err) => {
                    error!(error = %err, "failed to read stdin");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    if let Some(watcher) = watcher {
        watcher.shutdown();
    }
    runtime
        .shutdown(Duration::from_millis(args.drain_timeout_ms))
        .await;
    info!("engine stopped");
    Ok(())
}

fn load_flow_dir(registry: &FlowRegistry, dir: &Path, env: &PrepareEnv) -> anyhow::Result<()> {
    let files = flow_files_in(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for path in files {
        match load_flow_file(&path, env) {
            Ok(definition) => {
                if let Err(err) = registry.upsert(definition) {
                    error!(path = %path.display(), error = %err, "flow not registered");
                }
            }
            Err(err) => error!(path = %path.display(), error = %err, "flow file skipped"),
        }
    }
    Ok(())
}

fn submit_line(runtime: &Runtime, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<Message>(line) {
        Ok(message) => {
            if let Err(err) = runtime.submit(message) {
                warn!(error = %err, "message not accepted");
            }
        }
        Err(err) => warn!(error = %err, "ignoring malformed input line"),
    }
}
