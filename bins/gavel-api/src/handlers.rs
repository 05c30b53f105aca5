// HTTP route handlers for the Gavel API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use gavel_common::languages;
use gavel_common::redis;
use gavel_common::{Config, ErrorKind, JobRequest, JobStatus, Language, Submission, TestCase};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub language: String,
    pub source_code: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Why a submission was refused before queueing.
#[derive(Debug, PartialEq)]
pub enum Rejection {
    UnsupportedLanguage(String),
    TimeoutTooLarge { requested: u64, max: u64 },
    EmptySource,
}

impl Rejection {
    fn reason(&self) -> &'static str {
        match self {
            Rejection::UnsupportedLanguage(_) => "unsupported_language",
            Rejection::TimeoutTooLarge { .. } => "timeout_too_large",
            Rejection::EmptySource => "empty_source",
        }
    }

    fn into_body(self) -> ErrorResponse {
        match self {
            Rejection::UnsupportedLanguage(language) => ErrorResponse {
                error: format!("unsupported language: {}", language),
                error_kind: Some(ErrorKind::UnsupportedLanguage),
            },
            Rejection::TimeoutTooLarge { requested, max } => ErrorResponse {
                error: format!("timeout_ms {} exceeds maximum of {}", requested, max),
                error_kind: None,
            },
            Rejection::EmptySource => ErrorResponse {
                error: "source_code is empty".to_string(),
                error_kind: None,
            },
        }
    }
}

/// Client-input checks; nothing is queued unless these pass.
/// Returns the resolved language and the per-case timeout to use.
pub fn validate(request: &SubmitRequest, config: &Config) -> Result<(Language, u64), Rejection> {
    let spec = languages::resolve(&request.language)
        .map_err(|_| Rejection::UnsupportedLanguage(request.language.clone()))?;

    if let Some(requested) = request.timeout_ms {
        if requested > config.max_timeout_ms {
            return Err(Rejection::TimeoutTooLarge {
                requested,
                max: config.max_timeout_ms,
            });
        }
    }

    if request.source_code.trim().is_empty() {
        return Err(Rejection::EmptySource);
    }

    Ok((spec.language, config.effective_timeout_ms(request.timeout_ms)))
}

/// POST /execute - Validate and queue a submission
pub async fn submit_job(State(state): State<Arc<AppState>>, Json(payload): Json<SubmitRequest>) -> Response {
    let (language, timeout_ms) = match validate(&payload, &state.config) {
        Ok(accepted) => accepted,
        Err(rejection) => {
            warn!(reason = rejection.reason(), language = %payload.language, "Submission rejected");
            metrics::record_job_rejected(rejection.reason());
            metrics::record_request("/execute", "POST", 400);
            return (StatusCode::BAD_REQUEST, Json(rejection.into_body())).into_response();
        }
    };

    let job = JobRequest {
        id: Uuid::new_v4(),
        submission: Submission {
            language: language.to_string(),
            source_code: payload.source_code,
            test_cases: payload.test_cases,
        },
        timeout_ms,
    };

    let mut conn = state.redis.clone();
    match redis::push_job(&mut conn, &language, &job, state.config.result_ttl_secs).await {
        Ok(()) => {
            info!(
                job_id = %job.id,
                %language,
                cases = job.submission.test_cases.len(),
                "Job queued"
            );
            metrics::record_job_submitted(&language.to_string());
            metrics::record_request("/execute", "POST", 201);
            (StatusCode::CREATED, Json(SubmitResponse { job_id: job.id })).into_response()
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to queue job");
            metrics::record_request("/execute", "POST", 500);
            internal_error("failed to queue job")
        }
    }
}

/// GET /job/:id - Report when finished, status while pending
pub async fn get_job(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Response {
    let mut conn = state.redis.clone();

    match redis::get_result(&mut conn, &job_id).await {
        Ok(Some(report)) => {
            metrics::record_request("/job", "GET", 200);
            return (StatusCode::OK, Json(report)).into_response();
        }
        Ok(None) => {}
        Err(e) => {
            error!(%job_id, error = %e, "Failed to read job result");
            metrics::record_request("/job", "GET", 500);
            return internal_error("failed to read job result");
        }
    }

    match redis::get_status(&mut conn, &job_id).await {
        Ok(Some(status)) => {
            metrics::record_request("/job", "GET", 202);
            (StatusCode::ACCEPTED, Json(PendingResponse { job_id, status })).into_response()
        }
        Ok(None) => {
            metrics::record_request("/job", "GET", 404);
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("job {} not found", job_id),
                    error_kind: None,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(%job_id, error = %e, "Failed to read job status");
            metrics::record_request("/job", "GET", 500);
            internal_error("failed to read job status")
        }
    }
}

/// GET /languages - The registry table
pub async fn list_languages() -> impl IntoResponse {
    Json(languages::all())
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
}

/// GET /health - Liveness
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /metrics - Prometheus text format
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut conn = state.redis.clone();
    metrics::update_queue_depths(&mut conn).await;

    match metrics::render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            internal_error("failed to render metrics")
        }
    }
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.to_string(),
            error_kind: None,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(language: &str, source: &str, timeout_ms: Option<u64>) -> SubmitRequest {
        SubmitRequest {
            language: language.to_string(),
            source_code: source.to_string(),
            test_cases: vec![TestCase::new("1", "1")],
            timeout_ms,
        }
    }

    fn config() -> Config {
        Config {
            default_timeout_ms: 5000,
            max_timeout_ms: 30000,
            ..Config::default()
        }
    }

    #[test]
    fn test_accepts_alias_and_defaults_timeout() {
        let (language, timeout) = validate(&request("py", "print(1)", None), &config()).unwrap();
        assert_eq!(language, Language::Python);
        assert_eq!(timeout, 5000);
    }

    #[test]
    fn test_unsupported_language() {
        let rejection = validate(&request("cobol", "DISPLAY 1", None), &config()).unwrap_err();
        assert_eq!(rejection, Rejection::UnsupportedLanguage("cobol".to_string()));
        let body = rejection.into_body();
        assert_eq!(body.error_kind, Some(ErrorKind::UnsupportedLanguage));
    }

    #[test]
    fn test_timeout_above_maximum() {
        let rejection = validate(&request("java", "class Solution {}", Some(60_000)), &config()).unwrap_err();
        assert_eq!(rejection.reason(), "timeout_too_large");
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let (_, timeout) = validate(&request("cpp", "int main(){}", Some(0)), &config()).unwrap();
        assert_eq!(timeout, 1);
    }

    #[test]
    fn test_empty_source() {
        let rejection = validate(&request("js", "   ", None), &config()).unwrap_err();
        assert_eq!(rejection, Rejection::EmptySource);
    }

    #[test]
    fn test_request_without_cases_is_valid() {
        let payload: SubmitRequest =
            serde_json::from_str(r#"{"language":"python","source_code":"print(1)"}"#).unwrap();
        assert!(payload.test_cases.is_empty());
        assert!(validate(&payload, &config()).is_ok());
    }
}
