// CLI commands for running Gavel locally
use anyhow::{bail, Context, Result};
use gavel_common::languages;
use gavel_common::{Config, JobReport, SandboxBackend, TestCase, TestCaseSource, TestResult};
use gavel_judge::sandbox::{provider_from_config, DockerProvider};
use gavel_judge::{JudgeSettings, Orchestrator, SandboxPool};
use handlebars::Handlebars;
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

const REPORT_TEMPLATE: &str = r#"Language: {{language}}
Result:   {{passed_count}}/{{total_count}} passed ({{score}}%)
{{#each results}}
[{{index}}] {{#if passed}}PASS{{else}}FAIL{{#if error_kind}} ({{error_kind}}){{/if}}{{/if}}{{#if execution_time_ms}}  {{execution_time_ms}} ms{{/if}}
{{#unless passed}}{{#unless error_kind}}      expected: {{expected_output}}
      actual:   {{actual_output}}
{{/unless}}{{#if diagnostic}}      {{diagnostic}}
{{/if}}{{/unless}}{{/each}}"#;

/// Test cases on disk: either a bare list or `{"test_cases": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CaseFile {
    List(Vec<TestCase>),
    Wrapped { test_cases: Vec<TestCase> },
}

impl TestCaseSource for CaseFile {
    fn test_cases(&self) -> &[TestCase] {
        match self {
            CaseFile::List(cases) => cases,
            CaseFile::Wrapped { test_cases } => test_cases,
        }
    }
}

fn load_cases(path: &Path) -> Result<CaseFile> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse test cases in {}", path.display()))
}

/// List all supported languages
pub async fn list_languages() -> Result<()> {
    println!("📋 Supported Languages:\n");
    println!("{:<12} {:<16} {:<24} {:<36}", "Name", "Source file", "Image", "Run");
    println!("{}", "─".repeat(100));

    for spec in languages::all() {
        println!(
            "{:<12} {:<16} {:<24} {:<36}",
            spec.language.to_string(),
            spec.source_file,
            spec.image,
            spec.run.join(" ")
        );
        if let Some(compile) = spec.compile {
            println!("{:<12} compile: {}", "", compile.join(" "));
        }
    }

    println!("\n✅ Total: {} language(s)", languages::all().len());
    Ok(())
}

/// Judge a source file against a case file on this machine.
/// Returns whether every case passed.
pub async fn run_local(
    lang: &str,
    source_path: &Path,
    cases_path: &Path,
    backend: Option<SandboxBackend>,
    timeout_ms: Option<u64>,
    as_json: bool,
) -> Result<bool> {
    let source = fs::read_to_string(source_path)
        .with_context(|| format!("Failed to read {}", source_path.display()))?;
    let cases = load_cases(cases_path)?;

    let mut config = Config::from_env();
    if let Some(backend) = backend {
        config.sandbox_backend = backend;
    }
    if let Some(requested) = timeout_ms {
        if requested > config.max_timeout_ms {
            bail!("--timeout-ms {} exceeds the maximum of {}", requested, config.max_timeout_ms);
        }
    }
    let timeout = Duration::from_millis(config.effective_timeout_ms(timeout_ms));

    let provider = provider_from_config(&config).context("Failed to initialise sandbox backend")?;
    let pool = SandboxPool::from_config(provider, &config);
    let orchestrator = Orchestrator::new(pool, JudgeSettings::from_config(&config));

    let results = orchestrator
        .run_cases(lang, &source, &cases, Some(timeout))
        .await
        .context("Submission rejected")?;
    let report = JobReport::completed(Uuid::new_v4(), lang, results);
    let all_passed = report.passed_count == report.total_count;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report.results)?);
    } else {
        print!("{}", render_report(&report)?);
    }
    Ok(all_passed)
}

pub fn render_report(report: &JobReport) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);

    let data = json!({
        "language": report.language,
        "passed_count": report.passed_count,
        "total_count": report.total_count,
        "score": format!("{:.0}", report.score),
        "results": report.results.iter().map(result_view).collect::<Vec<_>>(),
    });

    handlebars
        .render_template(REPORT_TEMPLATE, &data)
        .context("Failed to render report template")
}

fn result_view(result: &TestResult) -> serde_json::Value {
    json!({
        "index": result.index,
        "passed": result.passed,
        "error_kind": result.error_kind.map(|k| k.as_str()),
        "execution_time_ms": result.execution_time_ms,
        "expected_output": result.expected_output.trim(),
        "actual_output": result.actual_output.trim(),
        "diagnostic": result.diagnostic.as_deref().map(str::trim_end),
    })
}

/// Pre-pull toolchain images so the first submission does not pay for it
pub async fn pull_images(lang: Option<&str>) -> Result<()> {
    let specs = match lang {
        Some(id) => vec![languages::resolve(id)?],
        None => languages::all().iter().collect(),
    };

    let config = Config::from_env();
    let docker = DockerProvider::connect(&config.sandbox_work_root).context("Failed to connect to Docker")?;

    for spec in specs {
        println!("⬇️  Pulling {} ({})", spec.image, spec.language);
        docker
            .ensure_image(spec.image)
            .await
            .with_context(|| format!("Failed to pull {}", spec.image))?;
    }

    println!("\n✅ Images ready");
    Ok(())
}
