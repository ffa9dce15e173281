mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use em_core::time::{millis_to_iso8601, now_millis};
use em_core::{EngineConfig, PatternDetector, SimField};
use em_runtime::Manager;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "em", about = "Emergence engine over a simulated field")]
struct Cli {
    /// TOML config file (falls back to $EM_CONFIG, then defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every component on its tick loop, then print status as JSON
    Run {
        /// Stop after this many seconds (default: run until ctrl-c)
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Seed for the simulated field
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run a single detection pass and print the patterns as JSON
    Detect {
        /// Seed for the simulated field
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn rng_for(seed: Option<u64>) -> SmallRng {
    match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = config::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Run {
            duration_secs,
            seed,
        } => cmd_run(config, *duration_secs, *seed).await,
        Commands::Detect { seed } => cmd_detect(&config, *seed),
        Commands::Config => cmd_config(&config),
    }
}

#[derive(Serialize)]
struct RunReport {
    started_at: String,
    stopped_at: String,
    components: Vec<em_core::StatusSnapshot>,
}

async fn cmd_run(config: EngineConfig, duration_secs: Option<u64>, seed: Option<u64>) -> Result<()> {
    let mut rng = rng_for(seed);
    let field = Arc::new(SimField::seeded(&config.field, &mut rng));
    let manager = match seed {
        Some(seed) => Manager::with_seed(config, field, seed),
        None => Manager::new(config, field),
    }
    .context("failed to build engine")?;

    let started = now_millis();
    manager.start().context("failed to start engine")?;
    tracing::info!("engine running since {}", millis_to_iso8601(started));

    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            tracing::info!("interrupted");
        }
    }

    manager.stop().await.context("engine did not stop cleanly")?;
    let report = RunReport {
        started_at: millis_to_iso8601(started),
        stopped_at: millis_to_iso8601(now_millis()),
        components: manager.status(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to serialize status")?
    );
    Ok(())
}

fn cmd_detect(config: &EngineConfig, seed: Option<u64>) -> Result<()> {
    let mut rng = rng_for(seed);
    let field = Arc::new(SimField::seeded(&config.field, &mut rng));
    let detector = PatternDetector::new(field, config.detector.clone());
    let patterns = detector.detect().context("detection failed")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&patterns).context("failed to serialize patterns")?
    );
    Ok(())
}

fn cmd_config(config: &EngineConfig) -> Result<()> {
    let text = toml::to_string_pretty(config).context("failed to serialize config")?;
    print!("{text}");
    Ok(())
}
