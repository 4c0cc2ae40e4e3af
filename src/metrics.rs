use anyhow::{Context, Result};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all job runner metrics
const PREFIX: &str = "timetrack";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Admission Metrics
    pub static ref JOBS_ADMITTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_admitted_total"), "Total jobs admitted by the job handler"),
        &["disposition"]
    ).expect("Failed to create jobs_admitted_total metric");

    // Outcome Metrics
    pub static ref JOBS_TERMINATED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_terminated_total"), "Total jobs that reached a terminal state"),
        &["outcome"]
    ).expect("Failed to create jobs_terminated_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Job run time from start to terminal state in seconds"
        )
        .buckets(vec![0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["outcome"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref JOBS_TIMED_OUT_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_timed_out_total"),
        "Total jobs cancelled by the timeout supervisor"
    ).expect("Failed to create jobs_timed_out_total metric");

    pub static ref JOBS_EVICTED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_evicted_total"),
        "Total terminal jobs evicted after the retention window"
    ).expect("Failed to create jobs_evicted_total metric");

    pub static ref JOBS_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_jobs_running"),
        "Number of jobs currently running"
    ).expect("Failed to create jobs_running metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOBS_ADMITTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_TERMINATED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_TIMED_OUT_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_EVICTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record an admission decision ("started" or "queued")
pub fn record_job_admitted(disposition: &str) {
    JOBS_ADMITTED_TOTAL.with_label_values(&[disposition]).inc();
}

pub fn record_job_started() {
    JOBS_RUNNING.inc();
}

/// Record a terminal transition. `run_time` is `None` for jobs that never ran.
pub fn record_job_terminated(outcome: &str, run_time: Option<Duration>) {
    JOBS_TERMINATED_TOTAL.with_label_values(&[outcome]).inc();
    if let Some(run_time) = run_time {
        JOBS_RUNNING.dec();
        JOB_DURATION_SECONDS
            .with_label_values(&[outcome])
            .observe(run_time.as_secs_f64());
    }
}

pub fn record_job_timed_out() {
    JOBS_TIMED_OUT_TOTAL.inc();
}

pub fn record_jobs_evicted(count: usize) {
    if count > 0 {
        JOBS_EVICTED_TOTAL.inc_by(count as f64);
    }
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_text() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
}
