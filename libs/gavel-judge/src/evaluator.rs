//! Test Evaluator - Language-Agnostic Verdicts
//!
//! **Core Responsibility:**
//! Turn one raw sandbox outcome into one [`TestResult`].
//!
//! **Critical Properties:**
//! - Knows nothing about containers, processes or language runtimes
//! - Pure function: (outcome, expected output) -> verdict
//!
//! **Verdict Rules (first match wins):**
//! 1. Sandbox could not be provided -> `sandbox_unavailable`
//! 2. Run hit the wall-clock limit -> `timeout`
//! 3. Output matches -> passed, whatever the exit status
//! 4. Mismatch with a non-zero/abnormal exit -> `runtime_error` (stderr kept)
//! 5. Plain mismatch -> failed with no error kind
//!
//! **Output Comparison:**
//! Leading/trailing whitespace of the whole output is ignored on both sides;
//! everything in between must match byte for byte.

use gavel_common::{ErrorKind, TestCase, TestResult};
use tracing::{debug, warn};

use crate::sandbox::{ExecutionOutcome, SandboxError};

/// Whole-output trim, then exact equality.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim() == expected.trim()
}

/// Verdict for one executed (or not executable) test case.
pub fn judge(index: usize, case: &TestCase, outcome: Result<ExecutionOutcome, SandboxError>) -> TestResult {
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(test_index = index, error = %e, "Test case had no sandbox");
            return sandbox_unavailable(index, case, &e);
        }
    };

    let output_truncated = outcome.stdout_truncated;
    let mut result = TestResult {
        index,
        passed: false,
        input: case.input.clone(),
        expected_output: case.expected_output.clone(),
        actual_output: outcome.stdout,
        execution_time_ms: Some(outcome.elapsed_ms),
        error_kind: None,
        diagnostic: None,
        exit_code: outcome.exit_code,
        output_truncated,
    };

    if outcome.timed_out {
        warn!(test_index = index, elapsed_ms = outcome.elapsed_ms, "Test case timed out");
        result.error_kind = Some(ErrorKind::Timeout);
        result.diagnostic = Some(format!("time limit exceeded after {} ms", outcome.elapsed_ms));
    } else if outputs_match(&result.actual_output, &case.expected_output) {
        result.passed = true;
    } else if outcome.exit_code != Some(0) {
        warn!(test_index = index, exit_code = ?outcome.exit_code, "Test case crashed");
        result.error_kind = Some(ErrorKind::RuntimeError);
        result.diagnostic = Some(runtime_diagnostic(&outcome.stderr, outcome.exit_code, outcome.stderr_truncated));
    }

    debug!(
        test_index = index,
        passed = result.passed,
        error_kind = result.error_kind.map(|k| k.as_str()),
        time_ms = outcome.elapsed_ms,
        "Test case judged"
    );
    result
}

/// Same compile failure for every case; nothing ran.
pub fn compile_failed(cases: &[TestCase], diagnostic: &str) -> Vec<TestResult> {
    cases
        .iter()
        .enumerate()
        .map(|(i, case)| TestResult::failed(i, case, ErrorKind::CompileError, diagnostic))
        .collect()
}

/// Every case reports the same operational failure.
pub fn unavailable_all(cases: &[TestCase], error: &SandboxError) -> Vec<TestResult> {
    cases
        .iter()
        .enumerate()
        .map(|(i, case)| sandbox_unavailable(i, case, error))
        .collect()
}

pub fn sandbox_unavailable(index: usize, case: &TestCase, error: &dyn std::fmt::Display) -> TestResult {
    TestResult::failed(index, case, ErrorKind::SandboxUnavailable, error.to_string())
}

fn runtime_diagnostic(stderr: &str, exit_code: Option<i32>, truncated: bool) -> String {
    let mut diagnostic = if stderr.trim().is_empty() {
        match exit_code {
            Some(code) => format!("process exited with status {}", code),
            None => "process terminated abnormally".to_string(),
        }
    } else {
        stderr.to_string()
    };
    if truncated {
        diagnostic.push_str("\n[stderr truncated]");
    }
    diagnostic
}
