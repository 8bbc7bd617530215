//! Prometheus metrics for the health aggregation pipeline.

use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Registry holding all health-aggregator metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Counts health checks performed, labelled by whether the call succeeded.
    pub static ref HEALTHCHECK_OUTCOME: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "health_aggregator_outcome",
            "Counts health checks performed including the outcome (whether or not the healthcheck call was successful)",
        ),
        &["performed_healthcheck_result"],
    )
    .unwrap();

    /// Number of health checks currently in flight.
    pub static ref CHECKS_IN_FLIGHT: IntGauge = IntGauge::new(
        "health_aggregator_checks_in_flight",
        "Records the number of health checks which are in flight at any one time",
    )
    .unwrap();

    /// Number of services queued awaiting a scrape of /__/health.
    pub static ref QUEUED_SERVICES: IntGauge = IntGauge::new(
        "health_aggregator_queued_services",
        "Records the number of services queued awaiting health aggregator to scrape /__/health",
    )
    .unwrap();

    /// Duration of pipeline jobs, labelled by job name.
    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "health_aggregator_job_duration_seconds",
            "Duration of health aggregator jobs",
        ),
        &["job"],
    )
    .unwrap();
}

pub const OUTCOME_SUCCESSFUL: &str = "successful";
pub const OUTCOME_FAILED: &str = "failed";
pub const JOB_PERSIST_RESULT: &str = "persist_result";

/// Register all metrics with the registry. Safe to call once at startup.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(HEALTHCHECK_OUTCOME.clone()))?;
    REGISTRY.register(Box::new(CHECKS_IN_FLIGHT.clone()))?;
    REGISTRY.register(Box::new(QUEUED_SERVICES.clone()))?;
    REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()))?;
    Ok(())
}

/// Render all registered metrics in the text exposition format.
pub fn gather() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&REGISTRY.gather())
}
