use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gavel_common::redis;
use gavel_common::types::CompletionEvent;
use gavel_common::{Config, ErrorKind, JobReport, JobRequest, JobStatus, Language, TestResult};
use gavel_judge::sandbox::provider_from_config;
use gavel_judge::{JudgeError, JudgeSettings, Orchestrator, SandboxPool};
use ::redis::aio::ConnectionManager;
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{error, info, warn};

/// BLPOP timeout; bounds how long shutdown waits on an idle queue.
const POP_TIMEOUT_SECS: f64 = 5.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env();
    info!(
        backend = ?config.sandbox_backend,
        languages = ?config.worker_languages,
        max_sandboxes = config.max_concurrent_sandboxes,
        max_jobs = config.max_parallel_jobs,
        "Gavel worker booting"
    );

    let provider = provider_from_config(&config).context("Failed to initialise sandbox backend")?;
    let pool = SandboxPool::from_config(provider, &config);
    let orchestrator = Orchestrator::new(pool, JudgeSettings::from_config(&config));

    let client = ::redis::Client::open(config.redis_url.as_str()).context("Invalid REDIS_URL")?;
    let conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    info!(redis_url = %config.redis_url, "Connected to Redis");

    let job_slots = config.max_parallel_jobs.max(1);
    let worker = Worker {
        conn,
        orchestrator,
        config: Arc::new(config),
        jobs: Arc::new(Semaphore::new(job_slots)),
    };

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, finishing in-flight jobs");
    };

    tokio::select! {
        _ = worker.run() => {},
        _ = shutdown => {},
    }

    // Wait for in-flight jobs to hand back their permits.
    let _ = worker.jobs.acquire_many(job_slots as u32).await;
    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

#[derive(Clone)]
struct Worker {
    conn: ConnectionManager,
    orchestrator: Orchestrator,
    config: Arc<Config>,
    jobs: Arc<Semaphore>,
}

impl Worker {
    async fn run(&self) {
        let mut conn = self.conn.clone();
        loop {
            // Only pop when a job slot is free, so queued work stays visible
            // to other workers.
            let permit = match self.jobs.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            match redis::pop_job(&mut conn, &self.config.worker_languages, POP_TIMEOUT_SECS).await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process_job(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Redis error while polling queues");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn process_job(&self, job: JobRequest) {
        let mut conn = self.conn.clone();
        let ttl = self.config.result_ttl_secs;
        let job_id = job.id;
        let language = job.submission.language.clone();

        info!(
            %job_id,
            %language,
            cases = job.submission.test_cases.len(),
            source_bytes = job.submission.source_code.len(),
            "Received job"
        );

        if let Err(e) = redis::set_status(&mut conn, &job_id, JobStatus::Running, ttl).await {
            warn!(%job_id, error = %e, "Failed to mark job running");
        }

        let report = self.judge(&job).await;
        info!(
            %job_id,
            status = ?report.status,
            passed = report.passed_count,
            total = report.total_count,
            "Job finished"
        );

        if let Err(e) = redis::store_result(&mut conn, &report, ttl).await {
            error!(%job_id, error = %e, "Failed to store job result");
            return;
        }

        let Some(language) = Language::parse(&report.language) else {
            return;
        };
        let event = CompletionEvent {
            job_id,
            language,
            status: report.status,
            execution_time_ms: report.total_execution_time_ms(),
        };
        if let Err(e) = redis::publish_completion(&mut conn, &event).await {
            warn!(%job_id, error = %e, "Failed to publish completion event");
        }
    }

    async fn judge(&self, job: &JobRequest) -> JobReport {
        let timeout = Duration::from_millis(self.config.effective_timeout_ms(Some(job.timeout_ms)));
        let orchestrator = self.orchestrator.clone();
        let submission = job.submission.clone();

        // A panic while judging must still leave a report behind.
        let judged = tokio::spawn(async move {
            orchestrator
                .run_cases(&submission.language, &submission.source_code, &submission, Some(timeout))
                .await
        })
        .await;

        report_for(job, judged)
    }
}

fn report_for(
    job: &JobRequest,
    judged: Result<Result<Vec<TestResult>, JudgeError>, JoinError>,
) -> JobReport {
    let language = &job.submission.language;
    match judged {
        Ok(Ok(results)) => JobReport::completed(job.id, language, results),
        Ok(Err(e @ JudgeError::UnsupportedLanguage(_))) => JobReport::rejected(
            job.id,
            language,
            JobStatus::Rejected,
            Some(ErrorKind::UnsupportedLanguage),
            e.to_string(),
        ),
        Ok(Err(e @ JudgeError::EmptySource)) => {
            JobReport::rejected(job.id, language, JobStatus::Rejected, None, e.to_string())
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Judging task died");
            JobReport::rejected(
                job.id,
                language,
                JobStatus::Failed,
                Some(ErrorKind::SandboxUnavailable),
                format!("judging aborted: {}", e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_common::{Submission, TestCase};
    use uuid::Uuid;

    fn job(language: &str) -> JobRequest {
        JobRequest {
            id: Uuid::new_v4(),
            submission: Submission {
                language: language.to_string(),
                source_code: "print(input())".to_string(),
                test_cases: vec![TestCase::new("1", "1")],
            },
            timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_crashed_judging_is_reported_as_failed() {
        let job = job("python");
        let crashed = tokio::spawn(async { panic!("judge blew up") }).await.map(|()| Ok(Vec::new()));

        let report = report_for(&job, crashed);

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error_kind, Some(ErrorKind::SandboxUnavailable));
        assert!(report.diagnostic.unwrap().starts_with("judging aborted"));
    }

    #[test]
    fn test_client_errors_are_rejected() {
        let job = job("cobol");
        let report = report_for(&job, Ok(Err(JudgeError::EmptySource)));
        assert_eq!(report.status, JobStatus::Rejected);
        assert_eq!(report.error_kind, None);

        let completed = report_for(&job, Ok(Ok(Vec::new())));
        assert_eq!(completed.status, JobStatus::Completed);
    }
}
