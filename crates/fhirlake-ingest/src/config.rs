//! Ingestion configuration
//!
//! Plain values threaded into the splitter and the orchestrator at
//! construction. Everything can be loaded from `FHIRLAKE_*` environment
//! variables.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::versioning::JobVersion;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Drop repeated resource types, keeping first occurrences in order
pub fn dedup_resource_types<I, S>(resource_types: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    resource_types
        .into_iter()
        .map(Into::into)
        .filter(|rt| seen.insert(rt.clone()))
        .collect()
}

/// Bounds and probing behaviour of the job splitter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitConfig {
    /// Smallest record count worth a job of its own
    pub low_bound: i64,
    /// Largest record count a single job should carry
    pub high_bound: i64,
    /// Whether a count exactly equal to `high_bound` is in range
    pub inclusive_high_bound: bool,
    /// Per count query timeout
    pub count_timeout_secs: u64,
    /// Attempts for the initial total count before giving up
    pub count_retry_attempts: u32,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            low_bound: 10_000,
            high_bound: 100_000,
            inclusive_high_bound: true,
            count_timeout_secs: 90,
            count_retry_attempts: 3,
        }
    }
}

impl SplitConfig {
    pub fn new(low_bound: i64, high_bound: i64) -> Self {
        Self {
            low_bound,
            high_bound,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            low_bound: env_or("FHIRLAKE_LOW_BOUND", defaults.low_bound),
            high_bound: env_or("FHIRLAKE_HIGH_BOUND", defaults.high_bound),
            inclusive_high_bound: env_or(
                "FHIRLAKE_INCLUSIVE_HIGH_BOUND",
                defaults.inclusive_high_bound,
            ),
            count_timeout_secs: env_or("FHIRLAKE_COUNT_TIMEOUT_SECS", defaults.count_timeout_secs),
            count_retry_attempts: env_or(
                "FHIRLAKE_COUNT_RETRY_ATTEMPTS",
                defaults.count_retry_attempts,
            ),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.low_bound <= 0 {
            anyhow::bail!("FHIRLAKE_LOW_BOUND must be greater than 0");
        }
        if self.low_bound > self.high_bound {
            anyhow::bail!(
                "FHIRLAKE_LOW_BOUND ({}) must not exceed FHIRLAKE_HIGH_BOUND ({})",
                self.low_bound,
                self.high_bound
            );
        }
        if !self.inclusive_high_bound && self.low_bound >= self.high_bound {
            anyhow::bail!(
                "FHIRLAKE_LOW_BOUND ({}) must be below an exclusive FHIRLAKE_HIGH_BOUND ({})",
                self.low_bound,
                self.high_bound
            );
        }
        if self.count_timeout_secs == 0 {
            anyhow::bail!("FHIRLAKE_COUNT_TIMEOUT_SECS must be greater than 0");
        }
        if self.count_retry_attempts == 0 {
            anyhow::bail!("FHIRLAKE_COUNT_RETRY_ATTEMPTS must be greater than 0");
        }
        Ok(())
    }

    pub fn count_timeout(&self) -> Duration {
        Duration::from_secs(self.count_timeout_secs)
    }
}

/// Dispatch, polling and checkpoint behaviour of the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Concurrency cap on tracked running jobs
    pub max_running_jobs: usize,
    /// Poll for completions right after a dispatch once this many run
    pub drain_threshold: usize,
    /// Delay between completion checks while at the cap or draining
    pub check_interval_secs: u64,
    pub checkpoint_write_retries: u32,
    pub job_version: JobVersion,
    /// Group scope batch size
    pub patients_per_job: usize,
    /// Fixed-timespan window length for a long or open-ended run
    pub initial_interval_secs: u64,
    /// Fixed-timespan window length for a run spanning at most an hour
    pub incremental_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_running_jobs: 5,
            drain_threshold: 3,
            check_interval_secs: 10,
            checkpoint_write_retries: 3,
            job_version: JobVersion::LATEST,
            patients_per_job: 100,
            initial_interval_secs: 1800,
            incremental_interval_secs: 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let job_version = match std::env::var("FHIRLAKE_JOB_VERSION") {
            Ok(raw) => raw
                .parse::<JobVersion>()
                .context("Invalid FHIRLAKE_JOB_VERSION")?,
            Err(_) => defaults.job_version,
        };

        Ok(Self {
            max_running_jobs: env_or("FHIRLAKE_MAX_RUNNING_JOBS", defaults.max_running_jobs),
            drain_threshold: env_or("FHIRLAKE_DRAIN_THRESHOLD", defaults.drain_threshold),
            check_interval_secs: env_or(
                "FHIRLAKE_CHECK_INTERVAL_SECS",
                defaults.check_interval_secs,
            ),
            checkpoint_write_retries: env_or(
                "FHIRLAKE_CHECKPOINT_WRITE_RETRIES",
                defaults.checkpoint_write_retries,
            ),
            job_version,
            patients_per_job: env_or("FHIRLAKE_PATIENTS_PER_JOB", defaults.patients_per_job),
            initial_interval_secs: env_or(
                "FHIRLAKE_INITIAL_INTERVAL_SECS",
                defaults.initial_interval_secs,
            ),
            incremental_interval_secs: env_or(
                "FHIRLAKE_INCREMENTAL_INTERVAL_SECS",
                defaults.incremental_interval_secs,
            ),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_running_jobs == 0 {
            anyhow::bail!("FHIRLAKE_MAX_RUNNING_JOBS must be greater than 0");
        }
        if self.check_interval_secs == 0 {
            anyhow::bail!("FHIRLAKE_CHECK_INTERVAL_SECS must be greater than 0");
        }
        if self.patients_per_job == 0 {
            anyhow::bail!("FHIRLAKE_PATIENTS_PER_JOB must be greater than 0");
        }
        if self.initial_interval_secs == 0 || self.incremental_interval_secs == 0 {
            anyhow::bail!("FHIRLAKE_*_INTERVAL_SECS must be greater than 0");
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_secs(self.initial_interval_secs)
    }

    pub fn incremental_interval(&self) -> Duration {
        Duration::from_secs(self.incremental_interval_secs)
    }
}

/// FHIR server connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FhirServerConfig {
    pub base_url: String,
    pub http_timeout_secs: u64,
}

impl Default for FhirServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/fhir".to_string(),
            http_timeout_secs: 120,
        }
    }
}

impl FhirServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("FHIRLAKE_FHIR_SERVER_URL").unwrap_or(defaults.base_url),
            http_timeout_secs: env_or("FHIRLAKE_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            anyhow::bail!("FHIRLAKE_FHIR_SERVER_URL must be an http(s) URL");
        }
        if self.http_timeout_secs == 0 {
            anyhow::bail!("FHIRLAKE_HTTP_TIMEOUT_SECS must be greater than 0");
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub fhir: FhirServerConfig,
    /// Resource types to extract, in dispatch order
    pub resource_types: Vec<String>,
    pub split: SplitConfig,
    pub orchestrator: OrchestratorConfig,
    pub database_url: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fhir: FhirServerConfig::default(),
            resource_types: vec![
                "Patient".to_string(),
                "Encounter".to_string(),
                "Observation".to_string(),
            ],
            split: SplitConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            database_url: None,
        }
    }
}

impl IngestConfig {
    /// Load from environment variables and validate
    pub fn from_env() -> anyhow::Result<Self> {
        let resource_types = match std::env::var("FHIRLAKE_RESOURCE_TYPES") {
            Ok(raw) => dedup_resource_types(
                raw.split(',').map(str::trim).filter(|s| !s.is_empty()),
            ),
            Err(_) => Self::default().resource_types,
        };

        let config = Self {
            fhir: FhirServerConfig::from_env(),
            resource_types,
            split: SplitConfig::from_env(),
            orchestrator: OrchestratorConfig::from_env()?,
            database_url: std::env::var("DATABASE_URL").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.resource_types.is_empty() {
            anyhow::bail!("FHIRLAKE_RESOURCE_TYPES must list at least one resource type");
        }
        self.fhir.validate()?;
        self.split.validate()?;
        self.orchestrator.validate()?;
        Ok(())
    }
}
