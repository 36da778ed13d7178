//! `ensemble`: inspect how a task would be analyzed and planned.

use clap::{Parser, Subcommand};
use ensemble_orchestrator::{ComplexityAnalyzer, OrchestratorConfig, WorkflowPlanner};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ensemble", about = "Ensemble: multi-worker task orchestration")]
struct Cli {
    /// Path to config file (defaults apply when it does not exist)
    #[arg(short, long, default_value = "ensemble.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a task description
    Analyze {
        /// Free-text task description
        text: String,
    },
    /// Show the task graph a description would produce
    Plan {
        /// Free-text task description
        text: String,
    },
    /// Print the effective safety limits
    Limits,
    /// List the worker types in the capability registry
    Workers,
}

async fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    if tokio::fs::try_exists(path).await? {
        let config = OrchestratorConfig::load(path).await?;
        info!(path = %path.display(), "Config loaded");
        Ok(config)
    } else {
        info!(path = %path.display(), "Config file not found; using defaults");
        Ok(OrchestratorConfig::default())
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;
    let registry = Arc::new(config.registry()?);

    match cli.command {
        Commands::Analyze { text } => {
            let analyzer = ComplexityAnalyzer::new(Arc::clone(&registry))?;
            print_json(&analyzer.analyze(&text))?;
        }
        Commands::Plan { text } => {
            let analyzer = ComplexityAnalyzer::new(Arc::clone(&registry))?;
            let planner = WorkflowPlanner::new(Arc::clone(&registry), config.thresholds);
            let analysis = analyzer.analyze(&text);
            let graph = planner.plan(&text, &analysis)?;
            print_json(&json!({
                "analysis": analysis,
                "strategy": graph.strategy.to_string(),
                "phases": graph.phase_count(),
                "max_width": graph.max_width(),
                "estimated_minutes": graph.estimated_minutes(&registry),
                "order": graph.topological_order()?,
                "graph": graph,
            }))?;
        }
        Commands::Limits => print_json(&config.safety)?,
        Commands::Workers => {
            println!("Registered worker types:");
            for d in registry.descriptors() {
                let capabilities: Vec<String> = d.capabilities.iter().map(ToString::to_string).collect();
                println!("  {} ({:?}, x{})", d.worker_type, d.default_mode, d.complexity_multiplier);
                println!("    capabilities: {}", capabilities.join(", "));
                if !d.tools.is_empty() {
                    println!("    tools: {}", d.tools.join(", "));
                }
            }
            println!("\nTotal: {} worker type(s)", registry.len());
        }
    }

    Ok(())
}
