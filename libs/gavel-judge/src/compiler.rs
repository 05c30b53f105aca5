//! Compilation stage.
//!
//! Runs at most once per submission. The result is an [`Artifact`]: a
//! directory holding everything the run command needs (the source file for
//! interpreted languages, the build output for compiled ones). Execution
//! sandboxes receive a private copy of it, so a test case can never modify
//! what the next one sees.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gavel_common::LanguageSpec;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::sandbox::{ExecutionOutcome, SandboxError, SandboxLimits, SandboxPool, Stage};

/// Read-only, shareable result of the compile stage.
#[derive(Debug)]
pub struct Artifact {
    dir: TempDir,
}

impl Artifact {
    fn create(work_root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(work_root)?;
        let dir = tempfile::Builder::new().prefix("gavel-artifact-").tempdir_in(work_root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copy the artifact's contents into a sandbox directory.
    pub async fn stage_into(&self, dest: &Path) -> std::io::Result<()> {
        copy_dir(self.path(), dest).await
    }
}

/// [`copy_tree`] on the blocking pool.
async fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
        .await
        .map_err(std::io::Error::other)?
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            // fs::copy keeps the mode bits, so executables stay executable.
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[derive(Debug)]
pub enum CompileOutcome {
    /// Interpreted language: the artifact is just the source file.
    NotNeeded(Artifact),
    Compiled(Artifact),
    /// The compiler rejected the source (or ran out of time).
    Failed { diagnostic: String },
    /// No sandbox could be provided for the compiler.
    Unavailable(SandboxError),
}

pub struct CompilerStage {
    pool: SandboxPool,
    limits: SandboxLimits,
    timeout: Duration,
    work_root: PathBuf,
}

impl CompilerStage {
    pub fn new(pool: SandboxPool, limits: SandboxLimits, timeout: Duration, work_root: PathBuf) -> Self {
        Self {
            pool,
            limits,
            timeout,
            work_root,
        }
    }

    pub async fn prepare(&self, spec: &LanguageSpec, source: &str) -> CompileOutcome {
        let artifact = match Artifact::create(&self.work_root) {
            Ok(artifact) => artifact,
            Err(e) => return CompileOutcome::Unavailable(e.into()),
        };

        let Some(command) = spec.compile_command() else {
            return match tokio::fs::write(artifact.path().join(spec.source_file), source).await {
                Ok(()) => CompileOutcome::NotNeeded(artifact),
                Err(e) => CompileOutcome::Unavailable(e.into()),
            };
        };

        let lease = match self.pool.acquire(Stage::Compile, &self.limits, spec.image).await {
            Ok(lease) => lease,
            Err(e) => return CompileOutcome::Unavailable(e),
        };
        let workdir = lease.sandbox().workdir().to_path_buf();

        let compiled = async {
            tokio::fs::write(workdir.join(spec.source_file), source).await?;
            let outcome = lease.run(&command, b"", self.timeout).await?;
            if outcome.success() {
                copy_dir(&workdir, artifact.path()).await?;
            }
            Ok::<_, SandboxError>(outcome)
        }
        .await;
        lease.release().await;

        match compiled {
            Ok(outcome) if outcome.success() => {
                info!(language = %spec.language, time_ms = outcome.elapsed_ms, "Compilation succeeded");
                CompileOutcome::Compiled(artifact)
            }
            Ok(outcome) => {
                let diagnostic = compile_diagnostic(&outcome, self.timeout);
                debug!(language = %spec.language, exit_code = ?outcome.exit_code, "Compilation failed");
                CompileOutcome::Failed { diagnostic }
            }
            Err(e) => CompileOutcome::Unavailable(e),
        }
    }
}

/// Compiler stderr, falling back to stdout (javac and some g++ wrappers
/// write there).
fn compile_diagnostic(outcome: &ExecutionOutcome, timeout: Duration) -> String {
    let mut diagnostic = if !outcome.stderr.trim().is_empty() {
        outcome.stderr.clone()
    } else if !outcome.stdout.trim().is_empty() {
        outcome.stdout.clone()
    } else if outcome.timed_out {
        String::new()
    } else {
        match outcome.exit_code {
            Some(code) => format!("compiler exited with status {}", code),
            None => "compiler terminated abnormally".to_string(),
        }
    };

    if outcome.timed_out {
        if !diagnostic.is_empty() {
            diagnostic.push('\n');
        }
        diagnostic.push_str(&format!("compilation timed out after {} ms", timeout.as_millis()));
    }
    if outcome.stderr_truncated || outcome.stdout_truncated {
        diagnostic.push_str("\n[compiler output truncated]");
    }
    diagnostic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::scripted::{Reply, ScriptedProvider};
    use gavel_common::languages::resolve;
    use std::sync::Arc;

    fn stage(provider: Arc<ScriptedProvider>, root: &Path) -> CompilerStage {
        let pool = SandboxPool::new(provider, 2, Duration::from_secs(1));
        CompilerStage::new(pool, SandboxLimits::default(), Duration::from_millis(200), root.to_path_buf())
    }

    /// Behaves like g++: writes the binary next to the source.
    fn fake_gxx() -> ScriptedProvider {
        ScriptedProvider::with_script(|command, _, dir| {
            if command.first().map(String::as_str) == Some("g++") {
                let source = std::fs::read_to_string(dir.join("solution.cpp")).unwrap_or_default();
                if source.contains("syntax error") {
                    return Reply::exit(1, "solution.cpp:1:1: error: expected unqualified-id");
                }
                std::fs::write(dir.join("solution"), "binary").unwrap();
            }
            Reply::default()
        })
    }

    #[tokio::test]
    async fn test_interpreted_source_needs_no_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let outcome = stage(provider.clone(), root.path())
            .prepare(resolve("python").unwrap(), "print(1)")
            .await;

        let artifact = match outcome {
            CompileOutcome::NotNeeded(artifact) => artifact,
            other => panic!("expected NotNeeded, got {:?}", other),
        };
        let written = std::fs::read_to_string(artifact.path().join("solution.py")).unwrap();
        assert_eq!(written, "print(1)");
        assert_eq!(provider.acquired_count(), 0);
    }

    #[tokio::test]
    async fn test_successful_compile_keeps_build_output() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(fake_gxx());
        let outcome = stage(provider.clone(), root.path())
            .prepare(resolve("cpp").unwrap(), "int main() {}")
            .await;

        let artifact = match outcome {
            CompileOutcome::Compiled(artifact) => artifact,
            other => panic!("expected Compiled, got {:?}", other),
        };
        assert!(artifact.path().join("solution").exists());
        assert!(artifact.path().join("solution.cpp").exists());
        assert_eq!(provider.acquired_count(), 1);
        assert_eq!(provider.released_count(), 1);
        assert_eq!(provider.leftover_dirs(), 0);

        let dest = tempfile::tempdir().unwrap();
        artifact.stage_into(dest.path()).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest.path().join("solution")).unwrap(), "binary");
    }

    #[tokio::test]
    async fn test_nested_build_output_is_kept() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::with_script(|_, _, dir| {
            std::fs::write(dir.join("Solution.class"), "cafebabe").unwrap();
            std::fs::create_dir_all(dir.join("util")).unwrap();
            std::fs::write(dir.join("util").join("Helper.class"), "cafebabe").unwrap();
            Reply::default()
        }));
        let outcome = stage(provider, root.path())
            .prepare(resolve("java").unwrap(), "class Solution {}")
            .await;

        let artifact = match outcome {
            CompileOutcome::Compiled(artifact) => artifact,
            other => panic!("expected Compiled, got {:?}", other),
        };
        assert!(artifact.path().join("Solution.java").exists());
        assert!(artifact.path().join("util").join("Helper.class").exists());
    }

    #[tokio::test]
    async fn test_compile_error_carries_compiler_output() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(fake_gxx());
        let outcome = stage(provider.clone(), root.path())
            .prepare(resolve("cpp").unwrap(), "syntax error")
            .await;

        match outcome {
            CompileOutcome::Failed { diagnostic } => assert!(diagnostic.contains("expected unqualified-id")),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(provider.released_count(), 1);
    }

    #[tokio::test]
    async fn test_compile_timeout_is_a_compile_error() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::with_script(|_, _, _| Reply::hang()));
        let outcome = stage(provider, root.path())
            .prepare(resolve("java").unwrap(), "class Solution {}")
            .await;

        match outcome {
            CompileOutcome::Failed { diagnostic } => {
                assert_eq!(diagnostic, "compilation timed out after 200 ms");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_sandbox_for_compiler() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new().failing_acquire());
        let outcome = stage(provider, root.path())
            .prepare(resolve("cpp").unwrap(), "int main() {}")
            .await;
        assert!(matches!(outcome, CompileOutcome::Unavailable(_)));
    }

    #[test]
    fn test_diagnostic_falls_back_to_stdout() {
        let outcome = ExecutionOutcome {
            stdout: "Solution.java:3: error: ';' expected".to_string(),
            exit_code: Some(1),
            ..Default::default()
        };
        let diagnostic = compile_diagnostic(&outcome, Duration::from_secs(30));
        assert_eq!(diagnostic, "Solution.java:3: error: ';' expected");
    }
}
