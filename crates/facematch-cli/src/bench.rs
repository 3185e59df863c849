//! Offline enrollment/verification evaluation over a JSONL file of
//! pre-computed embeddings.

use crate::worker::{EnrollOutcome, EnrollPolicy, WorkerHandle};
use anyhow::Result;
use facematch_core::{Embedding, MatchThreshold};
use serde::{Deserialize, Serialize};
use std::io::BufRead;

/// One input line.
#[derive(Debug, Deserialize)]
struct Sample {
    identifier: String,
    embedding: Vec<f32>,
    /// Second capture of the same face used for the verification step.
    #[serde(default)]
    reprobe: Option<Vec<f32>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub samples: usize,
    pub successful_enrollments: usize,
    pub failed_enrollments: usize,
    /// Enrollments flagged as duplicates of a different sample.
    pub false_positives: usize,
    pub successful_verifications: usize,
    pub failed_verifications: usize,
}

/// Enroll every sample, counting duplicate hits, then verify each fresh
/// enrollment against its reprobe (or itself).
pub async fn run(
    worker: &WorkerHandle,
    input: impl BufRead,
    policy: EnrollPolicy,
    verify_threshold: MatchThreshold,
) -> Result<Tally> {
    let mut tally = Tally::default();

    for (line_no, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        tally.samples += 1;

        if let Err(e) = step(worker, &line, policy, verify_threshold, &mut tally).await {
            tracing::warn!(line = line_no + 1, error = %e, "bench: sample failed");
            tally.failed_enrollments += 1;
        }
    }

    tracing::info!(?tally, "bench finished");
    Ok(tally)
}

async fn step(
    worker: &WorkerHandle,
    line: &str,
    policy: EnrollPolicy,
    verify_threshold: MatchThreshold,
    tally: &mut Tally,
) -> Result<()> {
    let sample: Sample = serde_json::from_str(line)?;
    let probe = Embedding::from_vector(sample.embedding)?;
    let reprobe = match sample.reprobe {
        Some(v) => Embedding::from_vector(v)?,
        None => probe.clone(),
    };

    let id = match worker.enroll(sample.identifier, probe, policy).await? {
        EnrollOutcome::Enrolled { similar, .. } | EnrollOutcome::Duplicate { similar }
            if !similar.is_empty() =>
        {
            tally.failed_enrollments += 1;
            tally.false_positives += 1;
            return Ok(());
        }
        EnrollOutcome::Enrolled { record, .. } => record.id,
        EnrollOutcome::Duplicate { .. } => {
            tally.failed_enrollments += 1;
            return Ok(());
        }
    };
    tally.successful_enrollments += 1;

    // Verification errors still count against the verification rate.
    match worker.verify(id, reprobe, verify_threshold).await {
        Ok(outcome) if outcome.matched => tally.successful_verifications += 1,
        Ok(_) => tally.failed_verifications += 1,
        Err(e) => {
            tracing::warn!(id, error = %e, "bench: verification failed");
            tally.failed_verifications += 1;
        }
    }
    Ok(())
}
