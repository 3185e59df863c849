use anyhow::{bail, Context, Result};
use facematch_core::{MatchThreshold, SampleCap};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite enrollment store.
    pub db_path: PathBuf,
    /// Euclidean distance below which a verification succeeds.
    pub verify_threshold: MatchThreshold,
    /// Euclidean distance below which an enrollment counts as a duplicate.
    pub duplicate_threshold: MatchThreshold,
    /// How many enrolled faces a duplicate scan samples (None = all).
    pub sample_cap: SampleCap,
    /// Expected recognition model output length (None = unchecked).
    pub embedding_dim: Option<NonZeroUsize>,
    /// Whether enrollment is refused when a similar face already exists.
    pub reject_duplicates: bool,
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facematch");

        let db_path = lookup("FACEMATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("enrollments.db"));

        Ok(Self {
            db_path,
            verify_threshold: threshold(&lookup, "FACEMATCH_VERIFY_THRESHOLD", 0.65)?,
            duplicate_threshold: threshold(&lookup, "FACEMATCH_DUPLICATE_THRESHOLD", 0.75)?,
            sample_cap: NonZeroUsize::new(parse_or(&lookup, "FACEMATCH_SAMPLE_CAP", 500)?),
            embedding_dim: NonZeroUsize::new(parse_or(&lookup, "FACEMATCH_EMBEDDING_DIM", 192)?),
            reject_duplicates: lookup("FACEMATCH_REJECT_DUPLICATES")
                .map(|v| v != "0")
                .unwrap_or(true),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{key}={v:?} is not a valid value")),
        None => Ok(default),
    }
}

fn threshold(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f32,
) -> Result<MatchThreshold> {
    let value: f32 = parse_or(lookup, key, default)?;
    match MatchThreshold::new(value) {
        Ok(t) => Ok(t),
        Err(e) => bail!("{key}: {e}"),
    }
}
