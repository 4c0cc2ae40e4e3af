use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use timetrack_jobs::background_jobs::jobs::SimulatedJob;
use timetrack_jobs::background_jobs::{Job, JobHandler, JobInfo, JobSpec, JobStatus, QueueStrategy};
use timetrack_jobs::config::{
    parse_logging_level, AppConfig, CliConfig, FileConfig, DEFAULT_SHUTDOWN_GRACE_PERIOD_SECS,
    DEFAULT_SUPERVISOR_INTERVAL_MS, KEEP_TERMINATED_JOBS_INTERVAL_MS,
};
use timetrack_jobs::duration::display_duration;
use timetrack_jobs::metrics;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_SIMULATION_SECS: u64 = 3;

/// A simulated job given on the command line as `title[:area][:seconds]`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Simulation {
    title: String,
    area: Option<String>,
    seconds: u64,
}

fn parse_simulation(s: &str) -> Result<Simulation> {
    let parts: Vec<&str> = s.split(':').collect();
    let (title, area, seconds) = match parts.as_slice() {
        [title] => (*title, None, None),
        [title, last] => match last.parse::<u64>() {
            Ok(seconds) => (*title, None, Some(seconds)),
            Err(_) => (*title, Some(*last), None),
        },
        [title, area, seconds] => {
            let seconds = seconds
                .parse::<u64>()
                .with_context(|| format!("Invalid duration in simulation: {}", s))?;
            (*title, Some(*area), Some(seconds))
        }
        _ => bail!("Expected title[:area][:seconds], got: {}", s),
    };
    if title.is_empty() {
        bail!("Simulation title must not be empty");
    }

    Ok(Simulation {
        title: title.to_string(),
        area: area.filter(|a| !a.is_empty()).map(str::to_string),
        seconds: seconds.unwrap_or(DEFAULT_SIMULATION_SECS),
    })
}

fn parse_level(s: &str) -> Result<LevelFilter> {
    parse_logging_level(s).with_context(|| format!("Invalid logging level: {}", s))
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    None,
    PerQueue,
    PerQueueAndUser,
}

impl From<StrategyArg> for QueueStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::None => QueueStrategy::None,
            StrategyArg::PerQueue => QueueStrategy::PerQueue,
            StrategyArg::PerQueueAndUser => QueueStrategy::PerQueueAndUser,
        }
    }
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values in it override CLI arguments.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Default logging level, used when LOG_LEVEL is not set.
    #[clap(long, default_value = "info", value_parser = parse_level)]
    pub logging_level: LevelFilter,

    /// Interval between timeout/eviction supervisor runs.
    #[clap(long, default_value_t = DEFAULT_SUPERVISOR_INTERVAL_MS)]
    pub supervisor_interval_ms: u64,

    /// How long terminated jobs are kept before eviction.
    #[clap(long, default_value_t = KEEP_TERMINATED_JOBS_INTERVAL_MS)]
    pub keep_terminated_jobs_ms: u64,

    /// How long shutdown waits for running jobs to yield.
    #[clap(long, default_value_t = DEFAULT_SHUTDOWN_GRACE_PERIOD_SECS)]
    pub shutdown_grace_period_secs: u64,

    /// Job to simulate, as title[:area][:seconds]. Can be repeated.
    #[clap(long = "simulate", value_parser = parse_simulation)]
    pub simulations: Vec<Simulation>,

    /// Queue strategy applied to every simulated job.
    #[clap(long, value_enum, default_value = "per-queue")]
    pub strategy: StrategyArg,

    /// Cancel simulated jobs running longer than this.
    #[clap(long)]
    pub timeout_secs: Option<u64>,

    /// Make every simulated job fail when it reaches this step (0-based).
    #[clap(long)]
    pub fail_at_step: Option<u32>,

    /// User the simulated jobs are started for.
    #[clap(long)]
    pub user_id: Option<i64>,

    /// Print the final job list as JSON.
    #[clap(long)]
    pub json: bool,

    /// Print the collected metrics before exiting.
    #[clap(long)]
    pub metrics: bool,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            logging_level: self.logging_level,
            supervisor_interval_ms: self.supervisor_interval_ms,
            keep_terminated_jobs_ms: self.keep_terminated_jobs_ms,
            shutdown_grace_period_secs: self.shutdown_grace_period_secs,
        }
    }

    fn job_spec(&self, simulation: &Simulation) -> JobSpec {
        let mut spec =
            JobSpec::new(simulation.title.clone()).with_queue_strategy(self.strategy.into());
        if let Some(area) = &simulation.area {
            spec = spec.with_area(area.clone());
        }
        if let Some(user_id) = self.user_id {
            spec = spec.with_user(user_id);
        }
        if let Some(timeout_secs) = self.timeout_secs {
            spec = spec.with_timeout_secs(timeout_secs);
        }
        spec
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let app_config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(app_config.logging_level.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    if cli_args.simulations.is_empty() {
        warn!("Nothing to run, pass at least one --simulate title[:area][:seconds]");
        return Ok(());
    }

    let handler = JobHandler::start(app_config.job_handler.clone());

    let mut jobs: Vec<Arc<Job>> = Vec::with_capacity(cli_args.simulations.len());
    for simulation in &cli_args.simulations {
        let mut work = SimulatedJob::lasting(Duration::from_secs(simulation.seconds));
        if let Some(step) = cli_args.fail_at_step {
            work = work.failing_at(step);
        }
        let job = handler
            .add_job(cli_args.job_spec(simulation), Arc::new(work))
            .await?;
        jobs.push(job);
    }

    wait_for_jobs(&jobs).await;

    handler.shutdown_job_handler().await;
    print_jobs(&handler.list_jobs().await, cli_args.json)?;

    if cli_args.metrics {
        print!("{}", metrics::gather_text()?);
    }

    Ok(())
}

/// Wait until every job is terminal or the process is interrupted, logging
/// progress of running jobs every second.
async fn wait_for_jobs(jobs: &[Arc<Job>]) {
    let all_done = futures::future::join_all(jobs.iter().map(|job| job.wait_for_termination()));
    tokio::pin!(all_done);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut progress = tokio::time::interval(Duration::from_secs(1));
    // Skip the first immediate tick
    progress.tick().await;

    loop {
        tokio::select! {
            _ = &mut all_done => {
                info!("All jobs terminated");
                break;
            }
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for interrupt: {}", e);
                }
                info!("Interrupted, shutting down");
                break;
            }
            _ = progress.tick() => {
                for job in jobs.iter().filter(|job| job.status() == JobStatus::Running) {
                    if let Some(started) = job.start_time() {
                        info!(
                            "Job {} ({}) running for {}",
                            job.id(),
                            job.title(),
                            display_duration(started)
                        );
                    }
                }
            }
        }
    }
}

fn print_jobs(jobs: &[JobInfo], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(jobs)?);
        return Ok(());
    }

    println!(
        "{:>4}  {:<20} {:<12} {:<10} {:>10}  {}",
        "ID", "TITLE", "AREA", "STATUS", "RAN FOR", "DETAIL"
    );
    for job in jobs {
        let detail = match (&job.error_message, job.cancel_reason) {
            (Some(error), _) => error.clone(),
            (None, Some(reason)) => format!("cancelled: {}", reason.as_str()),
            (None, None) => String::new(),
        };
        println!(
            "{:>4}  {:<20} {:<12} {:<10} {:>10}  {}",
            job.id,
            job.title,
            job.area.as_deref().unwrap_or("-"),
            job.status,
            job.running_for.as_deref().unwrap_or("-"),
            detail
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simulation_title_only() {
        let simulation = parse_simulation("export").unwrap();

        assert_eq!(simulation.title, "export");
        assert!(simulation.area.is_none());
        assert_eq!(simulation.seconds, DEFAULT_SIMULATION_SECS);
    }

    #[test]
    fn test_parse_simulation_with_seconds_or_area() {
        let with_seconds = parse_simulation("export:7").unwrap();
        assert!(with_seconds.area.is_none());
        assert_eq!(with_seconds.seconds, 7);

        let with_area = parse_simulation("export:timesheets").unwrap();
        assert_eq!(with_area.area.as_deref(), Some("timesheets"));
        assert_eq!(with_area.seconds, DEFAULT_SIMULATION_SECS);
    }

    #[test]
    fn test_parse_simulation_full() {
        let simulation = parse_simulation("import:projects:12").unwrap();

        assert_eq!(
            simulation,
            Simulation {
                title: "import".to_string(),
                area: Some("projects".to_string()),
                seconds: 12,
            }
        );
    }

    #[test]
    fn test_parse_simulation_invalid() {
        assert!(parse_simulation("").is_err());
        assert!(parse_simulation(":5").is_err());
        assert!(parse_simulation("import:projects:soon").is_err());
        assert!(parse_simulation("a:b:1:2").is_err());
    }

    #[test]
    fn test_cli_args_build_job_spec() {
        let args = CliArgs::parse_from([
            "job-runner",
            "--simulate",
            "export:timesheets:2",
            "--strategy",
            "per-queue-and-user",
            "--user-id",
            "3",
            "--timeout-secs",
            "10",
            "--fail-at-step",
            "1",
        ]);

        let spec = args.job_spec(&args.simulations[0]);

        assert_eq!(spec.title, "export");
        assert_eq!(spec.area.as_deref(), Some("timesheets"));
        assert_eq!(spec.queue_strategy, QueueStrategy::PerQueueAndUser);
        assert_eq!(spec.user_id, Some(3));
        assert_eq!(spec.timeout, Some(Duration::from_secs(10)));
        assert_eq!(args.fail_at_step, Some(1));
    }
}
