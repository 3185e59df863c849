use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facematch_core::{Embedding, MatchThreshold};
use facematch_store::EnrollmentStore;
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::num::NonZeroUsize;
use std::path::PathBuf;

mod bench;
mod config;
mod worker;

use config::Config;
use worker::{spawn_worker, EnrollPolicy, WorkerError};

#[derive(Parser)]
#[command(name = "facematch", about = "Face embedding enrollment and verification")]
struct Cli {
    /// Enrollment database (overrides FACEMATCH_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face embedding
    Enroll {
        /// Subject label
        #[arg(short, long)]
        identifier: String,
        /// Embedding text, or @file to read it from a file
        #[arg(short, long)]
        probe: String,
        /// Duplicate-scan distance threshold
        #[arg(long)]
        threshold: Option<f32>,
        /// Duplicate-scan sample size, 0 for an exhaustive scan
        #[arg(long)]
        sample_cap: Option<usize>,
        /// Store the face even if a similar one is enrolled
        #[arg(long)]
        allow_duplicates: bool,
    },
    /// Verify one or more captures against an enrollment
    Verify {
        /// Enrollment id
        id: i64,
        /// Embedding text or @file; repeat for a burst of frames
        #[arg(short, long, required = true)]
        probe: Vec<String>,
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// List enrollments similar to a probe
    Similar {
        #[arg(short, long)]
        probe: String,
        #[arg(long)]
        threshold: Option<f32>,
        /// Sample size, 0 for an exhaustive scan
        #[arg(long)]
        sample_cap: Option<usize>,
    },
    /// Find the nearest enrollment to a probe
    Identify {
        #[arg(short, long)]
        probe: String,
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// List enrollments
    List,
    /// Show enrollment and verification totals
    Stats,
    /// Delete every enrollment
    Clear,
    /// Copy text embeddings into the binary column
    Migrate,
    /// Replay a JSONL file of embeddings through enroll + verify
    Bench {
        #[arg(short, long)]
        input: PathBuf,
        /// Use the configured database instead of a scratch in-memory one
        #[arg(long)]
        persist: bool,
    },
}

#[derive(Serialize)]
struct VerifyBurst {
    matched: bool,
    results: Vec<worker::VerifyOutcome>,
    dropped: usize,
    errors: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let in_memory = matches!(cli.command, Commands::Bench { persist: false, .. });
    let store = if in_memory {
        EnrollmentStore::open_in_memory()?
    } else {
        EnrollmentStore::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?
    };
    let worker = spawn_worker(store, config.embedding_dim)?;

    match cli.command {
        Commands::Enroll {
            identifier,
            probe,
            threshold,
            sample_cap,
            allow_duplicates,
        } => {
            let policy = EnrollPolicy {
                duplicate_threshold: threshold_or(threshold, config.duplicate_threshold)?,
                sample_cap: sample_cap.map_or(config.sample_cap, NonZeroUsize::new),
                reject_duplicates: config.reject_duplicates && !allow_duplicates,
            };
            let outcome = worker.enroll(identifier, read_probe(&probe)?, policy).await?;
            print_json(&outcome)?;
        }
        Commands::Verify {
            id,
            probe,
            threshold,
        } => {
            let threshold = threshold_or(threshold, config.verify_threshold)?;
            let mut pending = Vec::new();
            let mut dropped = 0;
            for p in &probe {
                match worker.try_verify(id, read_probe(p)?, threshold) {
                    Ok(reply) => pending.push(reply),
                    Err(WorkerError::Busy) => {
                        tracing::debug!(id, "verify: worker busy, frame dropped");
                        dropped += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let mut burst = VerifyBurst {
                matched: false,
                results: Vec::new(),
                dropped,
                errors: Vec::new(),
            };
            for reply in pending {
                match reply.await {
                    Ok(outcome) => {
                        burst.matched |= outcome.matched;
                        burst.results.push(outcome);
                    }
                    Err(e) => burst.errors.push(e.to_string()),
                }
            }
            print_json(&burst)?;
        }
        Commands::Similar {
            probe,
            threshold,
            sample_cap,
        } => {
            let outcome = worker
                .similar(
                    read_probe(&probe)?,
                    threshold_or(threshold, config.duplicate_threshold)?,
                    sample_cap.map_or(config.sample_cap, NonZeroUsize::new),
                )
                .await?;
            print_json(&outcome)?;
        }
        Commands::Identify { probe, threshold } => {
            let outcome = worker
                .identify(read_probe(&probe)?, threshold_or(threshold, config.verify_threshold)?)
                .await?;
            print_json(&outcome)?;
        }
        Commands::List => print_json(&worker.list().await?)?,
        Commands::Stats => print_json(&worker.stats().await?)?,
        Commands::Clear => {
            let removed = worker.clear().await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Commands::Migrate => print_json(&worker.migrate().await?)?,
        Commands::Bench { input, .. } => {
            let file = File::open(&input)
                .with_context(|| format!("opening {}", input.display()))?;
            let policy = EnrollPolicy {
                duplicate_threshold: config.duplicate_threshold,
                sample_cap: config.sample_cap,
                reject_duplicates: config.reject_duplicates,
            };
            let tally =
                bench::run(&worker, BufReader::new(file), policy, config.verify_threshold).await?;
            print_json(&tally)?;
        }
    }

    Ok(())
}

/// Parse a probe given inline or as `@path`.
fn read_probe(arg: &str) -> Result<Embedding> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
        None => arg.to_string(),
    };
    text.parse().context("probe is not a valid embedding")
}

fn threshold_or(flag: Option<f32>, default: MatchThreshold) -> Result<MatchThreshold> {
    match flag {
        Some(t) => Ok(MatchThreshold::new(t)?),
        None => Ok(default),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
