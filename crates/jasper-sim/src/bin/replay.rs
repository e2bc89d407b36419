//! jasper-replay: run the replay model from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Check 2 groups x 2 peers over the configured number of seeds
//! jasper-replay --groups 2 --peers 2
//!
//! # Reproduce one seed with a job
//! jasper-replay --seed 12345 --jobs 1
//!
//! # Walk interleavings depth first
//! jasper-replay --explore --budget 1000
//! ```
//!
//! Prints a JSON summary on stdout. Liveness failures also write the state
//! dump to the configured dump directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use jasper_config::{ConfigLoader, JasperConfig};
use jasper_sim::{Population, ReplayError, ReplayOptions, check_convergence, explore};
use serde_json::json;

#[derive(Parser)]
#[command(name = "jasper-replay")]
#[command(author, version, about = "Check that the Jasper protocol converges under every interleaving", long_about = None)]
struct Cli {
    /// Number of groups.
    #[arg(long, default_value = "2")]
    groups: usize,

    /// Virtual peers per group.
    #[arg(long, default_value = "2")]
    peers: usize,

    /// Single-task jobs submitted by a client.
    #[arg(long, default_value = "0")]
    jobs: usize,

    /// Run exactly this seed.
    #[arg(long, conflicts_with = "explore")]
    seed: Option<u64>,

    /// Number of seeds to run, starting at `--first-seed`.
    #[arg(long)]
    seeds: Option<u64>,

    #[arg(long, default_value = "0")]
    first_seed: u64,

    /// Walk interleavings depth first instead of sampling seeds.
    #[arg(long)]
    explore: bool,

    /// Maximum interleavings walked by `--explore`.
    #[arg(long)]
    budget: Option<usize>,

    /// Applied entries after which a run is a liveness failure.
    #[arg(long)]
    ceiling: Option<usize>,

    /// Project directory holding jasper.toml.
    #[arg(long, default_value = ".")]
    project: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::new()
        .with_project_dir(&cli.project)
        .load()
        .context("failed to load configuration")?;

    let mut options = ReplayOptions::from(&config.replay);
    if let Some(ceiling) = cli.ceiling {
        options = options.with_ceiling(ceiling);
    }
    let population = Population::grid(cli.groups, cli.peers).with_jobs(cli.jobs);
    tracing::info!(
        groups = cli.groups,
        peers = cli.peers,
        jobs = cli.jobs,
        ceiling = options.ceiling,
        "starting replay"
    );

    let result = if cli.explore {
        let budget = cli.budget.unwrap_or(config.replay.explore_budget);
        explore(&population, options, budget)
            .map(|exploration| json!({ "exploration": exploration }))
    } else {
        let seeds: Vec<u64> = match cli.seed {
            Some(seed) => vec![seed],
            None => {
                let count = cli.seeds.unwrap_or(config.replay.seeds);
                (cli.first_seed..cli.first_seed.saturating_add(count)).collect()
            }
        };
        check_convergence(&population, options, seeds)
            .map(|convergence| json!({ "convergence": convergence }))
    };

    match result {
        Ok(summary) => {
            let report = json!({ "population": population, "ok": true, "result": summary });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(err) => {
            let dump = write_dump(&config, &err)?;
            let report = json!({
                "population": population,
                "ok": false,
                "error": err.to_string(),
                "dump": dump,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Err(err.into())
        }
    }
}

/// Writes the state dump of a liveness failure, returning its path.
fn write_dump(config: &JasperConfig, err: &ReplayError) -> Result<Option<PathBuf>> {
    let Some(dump) = err.dump() else {
        return Ok(None);
    };
    let dir = &config.replay.dump_dir;
    let path = dump
        .write_to(dir)
        .with_context(|| format!("failed to write replay dump into {}", dir.display()))?;
    tracing::error!(path = %path.display(), "wrote replay dump");
    Ok(Some(path))
}
