use crate::cli::{config::Config, error::CliResult, logging};
use clap::Args;
use colored::Colorize;
use fluxlora::AdapterRegistry;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct AdaptersCommand {
    /// Adapter directory
    #[arg(short, long, help = "Adapter directory (defaults to the configured one)")]
    pub dir: Option<PathBuf>,

    /// Print as JSON
    #[arg(long, help = "Print as JSON")]
    pub json: bool,
}

pub async fn execute(cmd: AdaptersCommand, config: Config) -> CliResult<()> {
    let registry = AdapterRegistry::new(cmd.dir.unwrap_or_else(|| config.paths.adapter_dir.clone()));
    let ids = registry.list()?;

    if cmd.json {
        let entries = ids
            .iter()
            .map(|id| match registry.inspect(id) {
                Ok(info) => serde_json::to_value(info),
                Err(e) => Ok(serde_json::json!({ "id": id, "error": e.to_string() })),
            })
            .collect::<Result<Vec<_>, _>>()?;
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if ids.is_empty() {
        logging::warning(&format!("No adapters in {}", registry.dir().display()));
        return Ok(());
    }

    println!("{}", format!("Adapters in {}", registry.dir().display()).bold());
    for (index, id) in ids.iter().enumerate() {
        let marker = if index == 0 { " (default)" } else { "" };
        match registry.inspect(id) {
            Ok(info) => {
                let rank = info
                    .rank
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "  {}{}  rank {}, {} tensors, {:.1} MB",
                    id.to_string().green(),
                    marker,
                    rank,
                    info.tensor_count,
                    info.size_bytes as f64 / (1024.0 * 1024.0)
                );
            }
            Err(e) => println!("  {}{}  {}", id.to_string().red(), marker, e),
        }
    }
    Ok(())
}
