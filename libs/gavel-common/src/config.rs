use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::languages::Language;

/// Which isolation backend runs submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackend {
    /// One container per sandbox through the Docker API.
    Docker,
    /// One rlimited process group per sandbox on the host.
    Process,
}

impl FromStr for SandboxBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(SandboxBackend::Docker),
            "process" => Ok(SandboxBackend::Process),
            other => Err(format!("unknown sandbox backend '{}' (expected docker or process)", other)),
        }
    }
}

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub compile_timeout_ms: u64,
    /// Per-stream ceiling on captured stdout/stderr.
    pub max_output_bytes: usize,
    pub sandbox_memory_mb: u64,
    pub sandbox_cpus: f64,
    pub sandbox_pids_limit: u64,
    /// System-wide number of sandboxes alive at once.
    pub max_concurrent_sandboxes: usize,
    pub sandbox_acquire_timeout_ms: u64,
    /// Bound on creating one sandbox, image pull included.
    pub sandbox_create_timeout_ms: u64,
    pub sandbox_backend: SandboxBackend,
    pub sandbox_work_root: PathBuf,
    pub sandbox_isolate_network: bool,
    pub max_parallel_jobs: usize,
    pub result_ttl_secs: u64,
    pub worker_languages: Vec<Language>,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            default_timeout_ms: parse_var("DEFAULT_TIMEOUT_MS").unwrap_or(5000),
            max_timeout_ms: parse_var("MAX_TIMEOUT_MS").unwrap_or(30000),
            compile_timeout_ms: parse_var("COMPILE_TIMEOUT_MS").unwrap_or(30000),
            max_output_bytes: parse_var("MAX_OUTPUT_BYTES").unwrap_or(1024 * 1024),
            sandbox_memory_mb: parse_var("SANDBOX_MEMORY_MB").unwrap_or(512),
            sandbox_cpus: parse_var("SANDBOX_CPUS").unwrap_or(1.0),
            sandbox_pids_limit: parse_var("SANDBOX_PIDS_LIMIT").unwrap_or(64),
            max_concurrent_sandboxes: parse_var("MAX_CONCURRENT_SANDBOXES")
                .unwrap_or_else(default_parallelism),
            sandbox_acquire_timeout_ms: parse_var("SANDBOX_ACQUIRE_TIMEOUT_MS").unwrap_or(30000),
            sandbox_create_timeout_ms: parse_var("SANDBOX_CREATE_TIMEOUT_MS").unwrap_or(120000),
            sandbox_backend: parse_var("SANDBOX_BACKEND").unwrap_or(SandboxBackend::Docker),
            sandbox_work_root: env::var("SANDBOX_WORK_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("gavel")),
            sandbox_isolate_network: parse_var("SANDBOX_ISOLATE_NETWORK").unwrap_or(true),
            max_parallel_jobs: parse_var("MAX_PARALLEL_JOBS").unwrap_or(4),
            result_ttl_secs: parse_var("RESULT_TTL_SECS").unwrap_or(3600),
            worker_languages: env::var("WORKER_LANGUAGES")
                .ok()
                .map(|v| parse_languages(&v))
                .filter(|langs| !langs.is_empty())
                .unwrap_or_else(|| Language::all_variants().to_vec()),
            port: parse_var("PORT").unwrap_or(3000),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }

    /// Clamp a requested per-case timeout into `1..=max_timeout_ms`,
    /// substituting the default when none was requested.
    pub fn effective_timeout_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_timeout_ms)
            .clamp(1, self.max_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

/// Comma-separated language list; unknown entries are skipped.
pub fn parse_languages(list: &str) -> Vec<Language> {
    let mut languages = Vec::new();
    for language in list.split(',').filter_map(Language::parse) {
        if !languages.contains(&language) {
            languages.push(language);
        }
    }
    languages
}
