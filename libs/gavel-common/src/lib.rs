pub mod types;
pub mod languages;
pub mod redis;
pub mod config;

// Re-export commonly used types for convenience
pub use types::{ErrorKind, JobReport, JobRequest, JobStatus, Submission, TestCase, TestCaseSource, TestResult};
pub use languages::{Language, LanguageSpec, UnsupportedLanguage};
pub use config::{Config, SandboxBackend};
