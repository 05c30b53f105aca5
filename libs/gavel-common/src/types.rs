use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::languages::Language;

/// Test Case Definition (Immutable Input)
/// Test cases are immutable - the judge must not mutate them.
/// Ordering matters - results come back in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
        }
    }
}

/// Anything that can hand the judge an ordered list of test cases.
///
/// The judge never talks to a problem store directly; whoever owns the
/// cases (a queued job, a CLI fixture file, a test) implements this.
pub trait TestCaseSource {
    fn test_cases(&self) -> &[TestCase];
}

impl TestCaseSource for [TestCase] {
    fn test_cases(&self) -> &[TestCase] {
        self
    }
}

impl TestCaseSource for Vec<TestCase> {
    fn test_cases(&self) -> &[TestCase] {
        self
    }
}

/// One grading request.
///
/// `language` stays a raw identifier here: an unknown language is a
/// client error reported by the registry, not a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub language: String,
    pub source_code: String,
    pub test_cases: Vec<TestCase>,
}

impl TestCaseSource for Submission {
    fn test_cases(&self) -> &[TestCase] {
        &self.test_cases
    }
}

/// Job Input (Immutable)
/// A queued submission - write-once, never mutate input fields.
///
/// ## Test Case Execution Semantics:
/// - Test cases execute concurrently, bounded by the worker's sandbox pool
/// - Results are always reported in input order
/// - Timeout applies per test case
/// - Empty test case list = instant completion with no results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: Uuid,
    #[serde(flatten)]
    pub submission: Submission,
    pub timeout_ms: u64,
}

/// Job State Machine
/// Backs: GET /job/{id}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    /// Every test case was judged (pass or fail).
    Completed,
    /// The request was invalid; nothing was executed.
    Rejected,
    /// The worker could not judge the job at all.
    Failed,
}

/// Why a test case did not pass, when the reason is not simply a wrong answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedLanguage,
    CompileError,
    RuntimeError,
    Timeout,
    /// Operational failure: the grader could not run the code.
    /// Retryable, and never the submitter's fault.
    SandboxUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedLanguage => "unsupported_language",
            ErrorKind::CompileError => "compile_error",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SandboxUnavailable => "sandbox_unavailable",
        }
    }
}

/// Per-Test Result
/// One per test case, in original order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub index: usize,
    pub passed: bool,
    pub input: String,
    pub expected_output: String,
    pub actual_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Compiler output, runtime stderr, or an operational message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output_truncated: bool,
}

impl TestResult {
    /// A failed result that never reached (or never finished) execution.
    pub fn failed(index: usize, case: &TestCase, kind: ErrorKind, diagnostic: impl Into<String>) -> Self {
        Self {
            index,
            passed: false,
            input: case.input.clone(),
            expected_output: case.expected_output.clone(),
            actual_output: String::new(),
            execution_time_ms: None,
            error_kind: Some(kind),
            diagnostic: Some(diagnostic.into()),
            exit_code: None,
            output_truncated: false,
        }
    }
}

/// Job Output
/// Written by workers, read by the API.
///
/// ## Summary Semantics:
/// - passed_count: number of results with `passed == true`
/// - score: passed_count / total_count as a percentage (0 when there are no cases)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub language: String,
    pub status: JobStatus,
    pub passed_count: usize,
    pub total_count: usize,
    pub score: f64,
    pub results: Vec<TestResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl JobReport {
    pub fn completed(job_id: Uuid, language: impl Into<String>, results: Vec<TestResult>) -> Self {
        let passed_count = results.iter().filter(|r| r.passed).count();
        let total_count = results.len();
        let score = if total_count == 0 {
            0.0
        } else {
            passed_count as f64 * 100.0 / total_count as f64
        };

        Self {
            job_id,
            language: language.into(),
            status: JobStatus::Completed,
            passed_count,
            total_count,
            score,
            results,
            error_kind: None,
            diagnostic: None,
            completed_at: Utc::now(),
        }
    }

    /// A report for a job that was never executed.
    pub fn rejected(
        job_id: Uuid,
        language: impl Into<String>,
        status: JobStatus,
        kind: Option<ErrorKind>,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            language: language.into(),
            status,
            passed_count: 0,
            total_count: 0,
            score: 0.0,
            results: Vec::new(),
            error_kind: kind,
            diagnostic: Some(diagnostic.into()),
            completed_at: Utc::now(),
        }
    }

    /// Wall time summed over every case that actually ran.
    pub fn total_execution_time_ms(&self) -> u64 {
        self.results.iter().filter_map(|r| r.execution_time_ms).sum()
    }
}

/// Published on the completions channel once a job report is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: Uuid,
    pub language: Language,
    pub status: JobStatus,
    pub execution_time_ms: u64,
}
