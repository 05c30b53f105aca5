//! Judge Orchestrator
//!
//! Drives one submission through the pipeline:
//!
//! 1. Resolve the language (unknown -> [`JudgeError::UnsupportedLanguage`],
//!    before any sandbox is touched)
//! 2. Compile once; a compile failure is reported on every test case and
//!    nothing is executed
//! 3. Execute the test cases concurrently, each in its own sandbox. At most
//!    pool-capacity cases of one submission are in flight at a time, so a
//!    case only waits on the pool when other submissions hold it
//! 4. Return the verdicts in input order
//!
//! A crashing or hanging test case only affects its own result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use gavel_common::languages::resolve;
use gavel_common::{Config, Submission, TestCaseSource, TestResult, UnsupportedLanguage};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::compiler::{CompileOutcome, CompilerStage};
use crate::engine::ExecutionStage;
use crate::evaluator;
use crate::sandbox::{SandboxLimits, SandboxPool};

/// Submission-level failures. Everything that happens after the request has
/// been accepted is reported per test case instead.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error(transparent)]
    UnsupportedLanguage(#[from] UnsupportedLanguage),
    #[error("source code is empty")]
    EmptySource,
}

/// Knobs for one orchestrator.
#[derive(Debug, Clone)]
pub struct JudgeSettings {
    pub run_timeout: Duration,
    pub compile_timeout: Duration,
    pub run_limits: SandboxLimits,
    pub compile_limits: SandboxLimits,
    /// Where compile artifacts are kept while a submission is judged.
    pub work_root: PathBuf,
}

impl JudgeSettings {
    pub fn from_config(config: &Config) -> Self {
        let run_limits = SandboxLimits::from_config(config);
        Self {
            run_timeout: Duration::from_millis(config.default_timeout_ms),
            compile_timeout: Duration::from_millis(config.compile_timeout_ms),
            compile_limits: run_limits.for_compilation(),
            run_limits,
            work_root: config.sandbox_work_root.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    pool: SandboxPool,
    settings: Arc<JudgeSettings>,
}

impl Orchestrator {
    pub fn new(pool: SandboxPool, settings: JudgeSettings) -> Self {
        Self {
            pool,
            settings: Arc::new(settings),
        }
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    /// Judge a submission with the default run timeout.
    pub async fn run(&self, submission: &Submission) -> Result<Vec<TestResult>, JudgeError> {
        self.run_cases(&submission.language, &submission.source_code, submission, None)
            .await
    }

    /// Judge `source` against `cases`. `timeout` overrides the per-case
    /// wall-clock limit.
    pub async fn run_cases<S>(
        &self,
        language: &str,
        source: &str,
        cases: &S,
        timeout: Option<Duration>,
    ) -> Result<Vec<TestResult>, JudgeError>
    where
        S: TestCaseSource + ?Sized,
    {
        let spec = resolve(language)?;
        if source.trim().is_empty() {
            return Err(JudgeError::EmptySource);
        }
        let cases = cases.test_cases();
        if cases.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let run_timeout = timeout.unwrap_or(self.settings.run_timeout);
        info!(
            language = %spec.language,
            cases = cases.len(),
            timeout_ms = run_timeout.as_millis() as u64,
            "Judging submission"
        );

        let compiler = CompilerStage::new(
            self.pool.clone(),
            self.settings.compile_limits.clone(),
            self.settings.compile_timeout,
            self.settings.work_root.clone(),
        );
        let artifact = match compiler.prepare(spec, source).await {
            CompileOutcome::NotNeeded(artifact) | CompileOutcome::Compiled(artifact) => Arc::new(artifact),
            CompileOutcome::Failed { diagnostic } => {
                info!(language = %spec.language, "Compile error reported on every test case");
                return Ok(evaluator::compile_failed(cases, &diagnostic));
            }
            CompileOutcome::Unavailable(e) => {
                error!(language = %spec.language, error = %e, "No sandbox for compilation");
                return Ok(evaluator::unavailable_all(cases, &e));
            }
        };

        let stage = Arc::new(ExecutionStage::new(self.pool.clone(), self.settings.run_limits.clone()));
        let in_flight = self.pool.capacity();
        let results: Vec<TestResult> = stream::iter(cases.iter().cloned().enumerate())
            .map(|(index, case)| {
                let stage = stage.clone();
                let artifact = artifact.clone();
                let task = tokio::spawn(async move {
                    let outcome = stage.execute(spec, &artifact, &case.input, run_timeout).await;
                    evaluator::judge(index, &case, outcome)
                });
                async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(index, error = %e, "Test case task died");
                            let reason = format!("test case task failed: {}", e);
                            evaluator::sandbox_unavailable(index, &cases[index], &reason)
                        }
                    }
                }
            })
            .buffered(in_flight)
            .collect()
            .await;

        let passed = results.iter().filter(|r| r.passed).count();
        info!(
            language = %spec.language,
            passed,
            total = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Submission judged"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::scripted::{Reply, ScriptedProvider};
    use crate::sandbox::{NetworkPolicy, ProcessProvider};
    use gavel_common::{ErrorKind, TestCase};

    struct Harness {
        provider: Arc<ScriptedProvider>,
        orchestrator: Orchestrator,
        _artifacts: tempfile::TempDir,
    }

    fn harness(provider: ScriptedProvider, capacity: usize) -> Harness {
        harness_with_wait(provider, capacity, Duration::from_secs(5))
    }

    fn harness_with_wait(provider: ScriptedProvider, capacity: usize, acquire_timeout: Duration) -> Harness {
        let provider = Arc::new(provider);
        let artifacts = tempfile::tempdir().unwrap();
        let pool = SandboxPool::new(provider.clone(), capacity, acquire_timeout);
        let settings = JudgeSettings {
            run_timeout: Duration::from_secs(2),
            compile_timeout: Duration::from_secs(2),
            run_limits: SandboxLimits::default(),
            compile_limits: SandboxLimits::default().for_compilation(),
            work_root: artifacts.path().to_path_buf(),
        };
        Harness {
            provider,
            orchestrator: Orchestrator::new(pool, settings),
            _artifacts: artifacts,
        }
    }

    fn cases(pairs: &[(&str, &str)]) -> Vec<TestCase> {
        pairs.iter().map(|(i, o)| TestCase::new(*i, *o)).collect()
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        // Later cases finish first.
        let h = harness(
            ScriptedProvider::with_script(|_, stdin, _| {
                let n: u64 = stdin.trim().parse().unwrap_or(0);
                Reply::stdout(stdin).after(Duration::from_millis((5 - n) * 30))
            }),
            8,
        );
        let cases = cases(&[("0", "0"), ("1", "1"), ("2", "2"), ("3", "3"), ("4", "4")]);

        let results = h.orchestrator.run_cases("python", "echo", &cases, None).await.unwrap();

        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.index, i);
            assert_eq!(result.input, i.to_string());
            assert!(result.passed);
        }
        assert_eq!(h.provider.leftover_dirs(), 0);
    }

    #[tokio::test]
    async fn test_long_suite_waits_behind_its_own_cases() {
        // Six 100 ms cases through one slot take far longer than the
        // 250 ms a single case may wait for the pool.
        let h = harness_with_wait(
            ScriptedProvider::with_script(|_, stdin, _| Reply::stdout(stdin).after(Duration::from_millis(100))),
            1,
            Duration::from_millis(250),
        );
        let cases = cases(&[("1", "1"), ("2", "2"), ("3", "3"), ("4", "4"), ("5", "5"), ("6", "6")]);

        let results = h.orchestrator.run_cases("python", "echo", &cases, None).await.unwrap();

        assert_eq!(results.len(), 6);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.index, i);
            assert!(result.passed, "case {} got {:?}", i, result.error_kind);
        }
        let snap = h.orchestrator.pool().snapshot();
        assert_eq!(snap.acquire_failures, 0);
        assert_eq!(snap.peak, 1);
    }

    #[tokio::test]
    async fn test_mixed_verdicts() {
        let h = harness(
            ScriptedProvider::with_script(|_, stdin, _| match stdin {
                "ok" => Reply::stdout("ok\n"),
                "wrong" => Reply::stdout("nope"),
                "crash" => Reply::exit(1, "Traceback: boom"),
                _ => Reply::hang(),
            }),
            4,
        );
        let cases = cases(&[("ok", "ok"), ("wrong", "right"), ("crash", "x"), ("spin", "y")]);

        let results = h
            .orchestrator
            .run_cases("python", "print()", &cases, Some(Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert_eq!(results[1].error_kind, None);
        assert_eq!(results[2].error_kind, Some(ErrorKind::RuntimeError));
        assert_eq!(results[3].error_kind, Some(ErrorKind::Timeout));
        assert_eq!(h.provider.released_count(), 4);
    }

    #[tokio::test]
    async fn test_compile_failure_short_circuits() {
        let h = harness(
            ScriptedProvider::with_script(|_, _, _| Reply::exit(1, "solution.cpp:1: error: 'x' was not declared")),
            4,
        );
        let cases = cases(&[("1", "1"), ("2", "2"), ("3", "3")]);

        let results = h
            .orchestrator
            .run_cases("cpp", "int main() { x; }", &cases, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.index, i);
            assert_eq!(result.error_kind, Some(ErrorKind::CompileError));
            assert_eq!(
                result.diagnostic.as_deref(),
                Some("solution.cpp:1: error: 'x' was not declared")
            );
        }
        let snap = h.orchestrator.pool().snapshot();
        assert_eq!(snap.compilations, 1);
        assert_eq!(snap.executions, 0);
        assert_eq!(h.provider.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_compiled_language_compiles_once() {
        let h = harness(
            ScriptedProvider::with_script(|command, stdin, dir| {
                if command[0] == "g++" {
                    std::fs::write(dir.join("solution"), "bin").unwrap();
                    return Reply::default();
                }
                assert!(dir.join("solution").exists(), "binary staged into run sandbox");
                Reply::stdout(stdin)
            }),
            4,
        );
        let cases = cases(&[("a", "a"), ("b", "b"), ("c", "c")]);

        let results = h
            .orchestrator
            .run_cases("c++", "int main() {}", &cases, None)
            .await
            .unwrap();

        assert!(results.iter().all(|r| r.passed));
        let snap = h.orchestrator.pool().snapshot();
        assert_eq!(snap.compilations, 1);
        assert_eq!(snap.executions, 3);
        assert_eq!(h.provider.leftover_dirs(), 0);
    }

    #[tokio::test]
    async fn test_cases_do_not_share_files() {
        let h = harness(
            ScriptedProvider::with_script(|_, stdin, dir| {
                let marker = dir.join("marker");
                if stdin == "write" {
                    std::fs::write(&marker, "x").unwrap();
                    Reply::stdout("written")
                } else if marker.exists() {
                    Reply::stdout("present")
                } else {
                    Reply::stdout("absent")
                }
            }),
            1,
        );
        let cases = cases(&[("write", "written"), ("check", "absent")]);

        let results = h.orchestrator.run_cases("python", "x", &cases, None).await.unwrap();

        assert!(results[0].passed);
        assert!(results[1].passed, "second case saw {:?}", results[1].actual_output);
    }

    #[tokio::test]
    async fn test_empty_cases_touch_nothing() {
        let h = harness(ScriptedProvider::new(), 1);
        let results = h.orchestrator.run_cases("java", "class Solution {}", &Vec::<TestCase>::new(), None).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(h.provider.acquired_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_language_is_rejected_up_front() {
        let h = harness(ScriptedProvider::new(), 1);
        let err = h
            .orchestrator
            .run_cases("brainfuck", "+++", &cases(&[("", "")]), None)
            .await
            .unwrap_err();

        assert!(matches!(err, JudgeError::UnsupportedLanguage(_)));
        assert_eq!(err.to_string(), "unsupported language: brainfuck");
        assert_eq!(h.provider.acquired_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_source_is_rejected() {
        let h = harness(ScriptedProvider::new(), 1);
        let err = h
            .orchestrator
            .run_cases("python", "  \n", &cases(&[("1", "1")]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::EmptySource));
    }

    #[tokio::test]
    async fn test_panicking_case_is_contained() {
        let h = harness(
            ScriptedProvider::with_script(|_, stdin, _| {
                if stdin == "boom" {
                    panic!("backend blew up");
                }
                Reply::stdout(stdin)
            }),
            4,
        );
        let cases = cases(&[("a", "a"), ("boom", "x"), ("c", "c")]);

        let results = h.orchestrator.run_cases("python", "x", &cases, None).await.unwrap();

        assert!(results[0].passed);
        assert_eq!(results[1].error_kind, Some(ErrorKind::SandboxUnavailable));
        assert!(results[2].passed);

        // The dropped lease is torn down in the background.
        for _ in 0..50 {
            if h.provider.released_count() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.provider.released_count(), 3);
    }

    #[tokio::test]
    async fn test_backend_down_marks_every_case_unavailable() {
        let h = harness(ScriptedProvider::new().failing_acquire(), 2);

        let interpreted = h
            .orchestrator
            .run_cases("python", "x", &cases(&[("1", "1"), ("2", "2")]), None)
            .await
            .unwrap();
        assert!(interpreted
            .iter()
            .all(|r| r.error_kind == Some(ErrorKind::SandboxUnavailable)));

        let compiled = h
            .orchestrator
            .run_cases("java", "class Solution {}", &cases(&[("1", "1"), ("2", "2")]), None)
            .await
            .unwrap();
        assert!(compiled
            .iter()
            .all(|r| r.error_kind == Some(ErrorKind::SandboxUnavailable)));
        assert_eq!(h.orchestrator.pool().snapshot().executions, 2);
    }

    #[tokio::test]
    async fn test_submission_entry_point() {
        let h = harness(ScriptedProvider::new(), 2);
        let submission = Submission {
            language: "js".to_string(),
            source_code: "process.stdin.pipe(process.stdout)".to_string(),
            test_cases: cases(&[("hi", "hi")]),
        };
        let results = h.orchestrator.run(&submission).await.unwrap();
        assert!(results[0].passed);
        assert_eq!(h.provider.commands()[0], vec!["node", "solution.js"]);
    }

    fn python3_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_python_end_to_end_with_processes() {
        if !python3_available() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(ProcessProvider::new(&root.path().join("sandboxes")));
        let pool = SandboxPool::new(provider, 4, Duration::from_secs(5));
        let run_limits = SandboxLimits {
            network: NetworkPolicy::Host,
            // Clamped to the host's hard RLIMIT_NPROC.
            pids: u64::MAX,
            ..Default::default()
        };
        let settings = JudgeSettings {
            run_timeout: Duration::from_secs(5),
            compile_timeout: Duration::from_secs(10),
            compile_limits: run_limits.for_compilation(),
            run_limits,
            work_root: root.path().join("artifacts"),
        };
        let orchestrator = Orchestrator::new(pool, settings);
        let cases = cases(&[("21\n", "42"), ("5\n", "10"), ("oops\n", "0")]);

        let results = orchestrator
            .run_cases("python", "print(int(input()) * 2)", &cases, None)
            .await
            .unwrap();

        assert!(results[0].passed);
        assert_eq!(results[0].actual_output.trim(), "42");
        assert!(results[1].passed);
        assert_eq!(results[2].error_kind, Some(ErrorKind::RuntimeError));
        assert!(results[2].diagnostic.as_deref().unwrap_or("").contains("ValueError"));
        for result in &results {
            let time_ms = result.execution_time_ms.expect("execution time recorded");
            assert!(time_ms < 5000, "case {} took {} ms", result.index, time_ms);
        }

        // Same code and input, same output.
        let again = orchestrator
            .run_cases("python", "print(int(input()) * 2)", &cases, None)
            .await
            .unwrap();
        for (first, second) in results.iter().zip(&again) {
            assert_eq!(first.actual_output, second.actual_output);
            assert_eq!(first.passed, second.passed);
            assert_eq!(first.error_kind, second.error_kind);
        }
    }
}
