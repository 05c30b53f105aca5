//! Execution Engine - one test case, one fresh sandbox.
//!
//! **Core Responsibility:**
//! Run a prepared [`Artifact`] against one input and return the raw outcome.
//!
//! **Critical Architectural Boundary:**
//! - Engine knows HOW to execute (through the sandbox pool)
//! - Engine does NOT evaluate correctness; that is the evaluator's job
//! - Every sandbox it acquires is released before `execute` returns

use std::time::Duration;

use gavel_common::LanguageSpec;
use tracing::debug;

use crate::compiler::Artifact;
use crate::sandbox::{ExecutionOutcome, SandboxError, SandboxLimits, SandboxPool, Stage};

pub struct ExecutionStage {
    pool: SandboxPool,
    limits: SandboxLimits,
}

impl ExecutionStage {
    pub fn new(pool: SandboxPool, limits: SandboxLimits) -> Self {
        Self { pool, limits }
    }

    /// Stage the artifact into a fresh sandbox, run the language's run
    /// command with `input` on stdin, tear the sandbox down.
    pub async fn execute(
        &self,
        spec: &LanguageSpec,
        artifact: &Artifact,
        input: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let lease = self.pool.acquire(Stage::Execute, &self.limits, spec.image).await?;

        let result = async {
            artifact.stage_into(lease.sandbox().workdir()).await?;
            lease.run(&spec.run_command(), input.as_bytes(), timeout).await
        }
        .await;

        debug!(
            sandbox_id = lease.sandbox().id(),
            ok = result.is_ok(),
            "Execution finished"
        );
        lease.release().await;
        result
    }
}
