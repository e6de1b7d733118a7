//! otf: on-the-fly active-learning molecular dynamics
//!
//! Subcommands:
//!
//! - `run`      -- Run a trajectory, calling the oracle whenever the
//!                 surrogate is unsure
//! - `check`    -- Validate a configuration and print the resolved settings
//! - `inspect`  -- Inspect a saved model checkpoint

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use otf_md::config::OtfConfig;
use otf_md::model::ModelCheckpoint;
use otf_md::otf::OtfRunner;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// otf: on-the-fly active-learning molecular dynamics
#[derive(Parser)]
#[command(name = "otf", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an on-the-fly trajectory.
    Run {
        /// Override the number of MD steps.
        #[arg(long)]
        steps: Option<usize>,

        /// Override the checkpoint written after a successful run.
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Validate the configuration without running anything.
    Check {
        /// Also print the fully resolved configuration as JSON.
        #[arg(long, default_value_t = false)]
        print: bool,
    },

    /// Inspect a saved model checkpoint.
    Inspect {
        /// Path to the checkpoint JSON file.
        #[arg(default_value = "data/checkpoint.json")]
        path: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => OtfConfig::load_from_file(path)?,
        None => OtfConfig::default(),
    };

    match cli.command {
        Commands::Run { steps, checkpoint } => cmd_run(config, steps, checkpoint).await,
        Commands::Check { print } => cmd_check(&config, print),
        Commands::Inspect { path } => cmd_inspect(&path),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(mut config: OtfConfig, steps: Option<usize>, checkpoint: Option<PathBuf>) -> Result<()> {
    if let Some(steps) = steps {
        config.md.steps = steps;
    }
    if let Some(path) = checkpoint {
        config.output.checkpoint_path = Some(path);
    }
    if let Some(parent) = config
        .output
        .checkpoint_path
        .as_ref()
        .and_then(|p| p.parent())
        .filter(|p| !p.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let (mut runner, initial) = OtfRunner::from_config(&config)?;
    let outcome = runner.run(initial).await?;

    tracing::info!(
        run_id = %outcome.run_id,
        steps = outcome.summary.steps,
        oracle_calls = outcome.summary.oracle_calls,
        wall_seconds = format!("{:.2}", outcome.summary.wall_seconds),
        "Run finished"
    );
    Ok(())
}

fn cmd_check(config: &OtfConfig, print: bool) -> Result<()> {
    config.validate().context("Configuration rejected")?;

    let initial = config.structure.to_configuration()?;
    println!("Configuration OK");
    println!("  Atoms: {}", initial.len());
    println!("  Species: {}", initial.unique_species().join(", "));
    println!("  Steps: {} x dt {}", config.md.steps, config.md.dt);
    println!("  Kernel: {}", config.model.kernel.as_str());
    println!("  Tolerance factor: {}", config.gate.factor);
    println!("  Max atoms added: {}", config.gate.max_atoms_added);
    match config.active_set.max_size {
        Some(cap) => println!("  Active set cap: {cap}"),
        None => println!("  Active set cap: unbounded"),
    }
    println!(
        "  Mapping: {}",
        if config.mapping.enabled { "enabled" } else { "disabled" }
    );

    if print {
        println!();
        println!("{}", serde_json::to_string_pretty(config)?);
    }
    Ok(())
}

fn cmd_inspect(path: &PathBuf) -> Result<()> {
    let checkpoint = ModelCheckpoint::load_from_file(path)?;

    println!("Model checkpoint: {}", path.display());
    println!("  Run: {}", checkpoint.run_id);
    println!(
        "  Created: {}",
        checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Kernel: {}", checkpoint.kernel.as_str());
    match checkpoint.cutoffs.three_body {
        Some(c3) => println!(
            "  Cutoffs: 2-body {}, 3-body {c3}",
            checkpoint.cutoffs.two_body
        ),
        None => println!("  Cutoffs: 2-body {}", checkpoint.cutoffs.two_body),
    }
    println!();

    println!("Hyperparameters:");
    for (name, value) in checkpoint.hyperparameters.named() {
        println!("  {name}: {value:.6}");
    }
    println!();

    let set = &checkpoint.active_set;
    println!("Active set:");
    println!("  Size: {}", set.len());
    match set.cap() {
        Some(cap) => println!("  Cap: {cap}"),
        None => println!("  Cap: unbounded"),
    }
    println!("  Generation: {}", set.generation());

    let mut by_step: std::collections::BTreeMap<usize, usize> = Default::default();
    for point in set.points() {
        *by_step.entry(point.provenance.step_index).or_default() += 1;
    }
    println!();
    println!("Labels by step:");
    for (step, count) in by_step.iter().take(20) {
        println!("  step {step}: {count}");
    }
    if by_step.len() > 20 {
        println!("  ... and {} more steps", by_step.len() - 20);
    }

    checkpoint
        .restore()
        .context("Checkpoint could not be refitted")?;
    println!();
    println!("Refit OK");
    Ok(())
}
