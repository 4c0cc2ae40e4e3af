mod file_config;

pub use file_config::{FileConfig, JobHandlerConfig};

use anyhow::{bail, Result};
use std::str::FromStr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// How long terminal jobs stay queryable before eviction.
pub const KEEP_TERMINATED_JOBS_INTERVAL_MS: u64 = 5 * 60 * 1000;

/// Default period of the timeout/eviction supervisor.
pub const DEFAULT_SUPERVISOR_INTERVAL_MS: u64 = 1000;

/// Default time shutdown waits for running jobs to yield.
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub logging_level: LevelFilter,
    pub supervisor_interval_ms: u64,
    pub keep_terminated_jobs_ms: u64,
    pub shutdown_grace_period_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            logging_level: LevelFilter::INFO,
            supervisor_interval_ms: DEFAULT_SUPERVISOR_INTERVAL_MS,
            keep_terminated_jobs_ms: KEEP_TERMINATED_JOBS_INTERVAL_MS,
            shutdown_grace_period_secs: DEFAULT_SHUTDOWN_GRACE_PERIOD_SECS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub logging_level: LevelFilter,
    pub job_handler: JobHandlerSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or(cli.logging_level);

        let jh_file = file.job_handler.unwrap_or_default();
        let supervisor_interval_ms = jh_file
            .supervisor_interval_ms
            .unwrap_or(cli.supervisor_interval_ms);
        if supervisor_interval_ms == 0 {
            bail!("supervisor_interval_ms must be greater than zero");
        }

        let job_handler = JobHandlerSettings {
            supervisor_interval: Duration::from_millis(supervisor_interval_ms),
            keep_terminated_jobs: Duration::from_millis(
                jh_file
                    .keep_terminated_jobs_ms
                    .unwrap_or(cli.keep_terminated_jobs_ms),
            ),
            shutdown_grace_period: Duration::from_secs(
                jh_file
                    .shutdown_grace_period_secs
                    .unwrap_or(cli.shutdown_grace_period_secs),
            ),
        };

        Ok(Self {
            logging_level,
            job_handler,
        })
    }
}

/// Settings of a [`crate::background_jobs::JobHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandlerSettings {
    /// Period of the timeout/eviction supervisor.
    pub supervisor_interval: Duration,
    /// Retention window for terminal jobs.
    pub keep_terminated_jobs: Duration,
    /// Upper bound shutdown waits for running jobs to yield.
    pub shutdown_grace_period: Duration,
}

impl Default for JobHandlerSettings {
    fn default() -> Self {
        Self {
            supervisor_interval: Duration::from_millis(DEFAULT_SUPERVISOR_INTERVAL_MS),
            keep_terminated_jobs: Duration::from_millis(KEEP_TERMINATED_JOBS_INTERVAL_MS),
            shutdown_grace_period: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_PERIOD_SECS),
        }
    }
}

/// Parses a logging level string ("off", "error", ..., "trace"), case insensitive.
pub fn parse_logging_level(s: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(s).ok()
}
