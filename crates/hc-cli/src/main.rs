//! hepcalc CLI

mod analysis;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;

use hc_calc::{Engine, EngineConfig, Fingerprint, Graph, PlotArtifact};

use crate::analysis::AnalysisConfig;

const RESULTS_SCHEMA: &str = "hepcalc_results_v1";

#[derive(Parser)]
#[command(name = "hepcalc")]
#[command(about = "hepcalc - cached, batched HEP analysis calculations")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate every request of an analysis in one batch
    Evaluate {
        /// Analysis definition (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Engine configuration (YAML or JSON). Defaults to an in-memory
        /// cache with data files next to the analysis.
        #[arg(long)]
        env: Option<PathBuf>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write one plot artifact per request into this directory.
        #[arg(long)]
        plot_dir: Option<PathBuf>,

        /// Threads (overrides the engine configuration; 0 = auto).
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Print the fingerprint of every base calculation of an analysis
    Fingerprint {
        /// Analysis definition (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Output file (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inspect or clear the result cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Print version
    Version,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Entry count and counters
    Stats {
        /// Engine configuration (YAML or JSON)
        #[arg(long)]
        env: PathBuf,
    },
    /// Remove one entry, or all of them
    Clear {
        /// Engine configuration (YAML or JSON)
        #[arg(long)]
        env: PathBuf,

        /// Fingerprint (64 hex chars) to remove. Removes everything if absent.
        #[arg(long)]
        fingerprint: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Evaluate { config, env, output, plot_dir, threads } => {
            cmd_evaluate(&config, env.as_deref(), output.as_ref(), plot_dir.as_deref(), threads)
        }
        Commands::Fingerprint { config, output } => cmd_fingerprint(&config, output.as_ref()),
        Commands::Cache { command } => match command {
            CacheCommands::Stats { env } => cmd_cache_stats(&env),
            CacheCommands::Clear { env, fingerprint } => cmd_cache_clear(&env, fingerprint.as_deref()),
        },
        Commands::Version => {
            println!("hepcalc {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn engine_config(env: Option<&Path>, analysis: &Path) -> Result<EngineConfig> {
    match env {
        Some(path) => Ok(EngineConfig::load(path)?),
        None => {
            let mut config = EngineConfig::default();
            config.resolve_paths(analysis.parent().unwrap_or(Path::new(".")));
            Ok(config)
        }
    }
}

fn cmd_evaluate(
    config_path: &Path,
    env: Option<&Path>,
    output: Option<&PathBuf>,
    plot_dir: Option<&Path>,
    threads: Option<usize>,
) -> Result<()> {
    let analysis = AnalysisConfig::load(config_path)?;
    let mut engine_config = engine_config(env, config_path)?;
    if let Some(t) = threads {
        engine_config.threads = t;
    }
    let engine = Engine::from_config(&engine_config).context("failed to create engine")?;

    let mut graph = Graph::new();
    let handles = analysis.build(&mut graph)?;
    let names: Vec<&String> = handles.keys().collect();
    let targets: Vec<_> = handles.values().copied().collect();
    let values = engine.evaluate_graph(&graph, &targets);

    let mut results = serde_json::Map::new();
    let mut failed = 0usize;
    for (name, value) in names.iter().zip(&values) {
        let entry = match value {
            Ok(v) => json!({ "value": v }),
            Err(e) => {
                failed += 1;
                tracing::warn!(request = %name, error = %e, "request failed");
                json!({ "error": format!("{e:#}") })
            }
        };
        results.insert((*name).clone(), entry);
    }

    if let Some(dir) = plot_dir {
        std::fs::create_dir_all(dir)?;
        for (name, value) in names.iter().zip(&values) {
            let (Ok(value), Some((process, region))) = (value, analysis.display(name)) else {
                continue;
            };
            let artifact = PlotArtifact::from_value(value, &process, &region)?;
            let path = dir.join(format!("{name}.json"));
            std::fs::write(&path, serde_json::to_string_pretty(&artifact)?)?;
        }
    }

    let stats = engine.stats()?;
    write_json(
        output,
        json!({
            "schema_version": RESULTS_SCHEMA,
            "results": results,
            "stats": stats,
        }),
    )?;

    if failed > 0 {
        bail!("{failed} of {} requests failed", values.len());
    }
    Ok(())
}

fn cmd_fingerprint(config_path: &Path, output: Option<&PathBuf>) -> Result<()> {
    let analysis = AnalysisConfig::load(config_path)?;
    let mut graph = Graph::new();
    let handles = analysis.build(&mut graph)?;

    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, handle) in &handles {
        if let Some(task) = graph.base_task(*handle) {
            out.insert(name.clone(), task.fingerprint().to_hex());
        }
    }
    write_json(output, serde_json::to_value(out)?)
}

fn cmd_cache_stats(env: &Path) -> Result<()> {
    let config = EngineConfig::load(env)?;
    let engine = Engine::from_config(&config)?;
    let stats = engine.stats()?;
    write_json(
        None,
        json!({
            "cache": config.cache,
            "entries": stats.entries,
        }),
    )
}

fn cmd_cache_clear(env: &Path, fingerprint: Option<&str>) -> Result<()> {
    let config = EngineConfig::load(env)?;
    let engine = Engine::from_config(&config)?;
    match fingerprint {
        Some(hex) => {
            let fp = hex.parse::<Fingerprint>().with_context(|| format!("invalid fingerprint '{hex}'"))?;
            engine.clear(&fp)?;
        }
        None => engine.clear_all()?,
    }
    let stats = engine.stats()?;
    write_json(None, json!({ "entries": stats.entries }))
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
