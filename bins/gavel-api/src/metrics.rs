// Prometheus metrics for the Gavel API

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder};

use gavel_common::Language;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref JOBS_SUBMITTED: CounterVec = CounterVec::new(
        Opts::new("gavel_jobs_submitted_total", "Total number of jobs queued"),
        &["language"]
    )
    .expect("metric can be created");

    pub static ref JOBS_COMPLETED: CounterVec = CounterVec::new(
        Opts::new("gavel_jobs_completed_total", "Total number of jobs finished by workers"),
        &["language", "status"]
    )
    .expect("metric can be created");

    // Summed per-case wall time of a job, in milliseconds
    pub static ref JOB_EXECUTION_TIME: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "gavel_job_execution_time_ms",
            "Job execution time in milliseconds"
        )
        .buckets(vec![100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0]),
        &["language"]
    )
    .expect("metric can be created");

    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("gavel_queue_depth", "Current queue depth per language"),
        &["language"]
    )
    .expect("metric can be created");

    pub static ref API_REQUESTS: CounterVec = CounterVec::new(
        Opts::new("gavel_api_requests_total", "Total API requests"),
        &["endpoint", "method", "status"]
    )
    .expect("metric can be created");

    // Submissions refused before queueing
    pub static ref JOBS_REJECTED: CounterVec = CounterVec::new(
        Opts::new("gavel_jobs_rejected_total", "Total jobs rejected by validation"),
        &["reason"]
    )
    .expect("metric can be created");
}

/// Register every collector. Called once at start-up.
pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(JOBS_SUBMITTED.clone()))?;
    REGISTRY.register(Box::new(JOBS_COMPLETED.clone()))?;
    REGISTRY.register(Box::new(JOB_EXECUTION_TIME.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(API_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(JOBS_REJECTED.clone()))?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

pub fn record_job_submitted(language: &str) {
    JOBS_SUBMITTED.with_label_values(&[language]).inc();
}

pub fn record_job_rejected(reason: &str) {
    JOBS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_job_completed(language: &str, status: &str, execution_time_ms: f64) {
    JOBS_COMPLETED.with_label_values(&[language, status]).inc();
    JOB_EXECUTION_TIME.with_label_values(&[language]).observe(execution_time_ms);
}

pub fn record_request(endpoint: &str, method: &str, status: u16) {
    API_REQUESTS
        .with_label_values(&[endpoint, method, &status.to_string()])
        .inc();
}

/// Refresh the queue depth gauge for every language
pub async fn update_queue_depths(redis_conn: &mut redis::aio::ConnectionManager) {
    use redis::AsyncCommands;

    for language in Language::all_variants() {
        let queue_name = gavel_common::redis::queue_name(language);
        if let Ok(depth) = redis_conn.llen::<_, i64>(&queue_name).await {
            QUEUE_DEPTH.with_label_values(&[&language.to_string()]).set(depth);
        }
    }
}
