use std::{fs, path::PathBuf};

use anyhow::Context;
use clap::Args;

use super::CliContext;
use crate::config::EngineConfig;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Write the schema to this file instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs, _context: &CliContext) -> anyhow::Result<()> {
    let schema = schemars::schema_for!(EngineConfig);
    let text = serde_json::to_string_pretty(&schema)?;
    match args.out {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
            println!("Schema written to {}", path.display());
        }
        None => println!("{text}"),
    }
    Ok(())
}
