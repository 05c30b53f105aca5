//! Language registry.
//!
//! A static table of every supported toolchain and how to drive it.
//! Adding a language means adding one variant and one table entry;
//! nothing else in the workspace branches on the language.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Strongly-typed language enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Java,
    Cpp,
}

/// How to compile and run one language inside a sandbox.
///
/// Invocations are argv vectors executed with the sandbox directory as the
/// working directory, so they refer to files by bare name.
#[derive(Debug, Clone, Serialize)]
pub struct LanguageSpec {
    pub language: Language,
    pub source_file: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<&'static [&'static str]>,
    pub run: &'static [&'static str],
    /// Container image used by the Docker backend.
    pub image: &'static str,
}

impl LanguageSpec {
    pub fn needs_compile(&self) -> bool {
        self.compile.is_some()
    }

    pub fn compile_command(&self) -> Option<Vec<String>> {
        self.compile.map(to_argv)
    }

    pub fn run_command(&self) -> Vec<String> {
        to_argv(self.run)
    }
}

fn to_argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

static REGISTRY: [LanguageSpec; 4] = [
    LanguageSpec {
        language: Language::Python,
        source_file: "solution.py",
        compile: None,
        run: &["python3", "solution.py"],
        image: "python:3.11-slim",
    },
    LanguageSpec {
        language: Language::JavaScript,
        source_file: "solution.js",
        compile: None,
        run: &["node", "solution.js"],
        image: "node:20-slim",
    },
    LanguageSpec {
        language: Language::Java,
        source_file: "Solution.java",
        compile: Some(&["javac", "Solution.java"]),
        run: &["java", "-cp", ".", "Solution"],
        image: "eclipse-temurin:17-jdk",
    },
    LanguageSpec {
        language: Language::Cpp,
        source_file: "solution.cpp",
        compile: Some(&["g++", "-std=c++17", "-O2", "-o", "solution", "solution.cpp"]),
        run: &["./solution"],
        image: "gcc:13",
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

impl Language {
    /// Returns all language variants
    /// This is the single source of truth for available languages
    pub fn all_variants() -> &'static [Language] {
        &[Language::Python, Language::JavaScript, Language::Java, Language::Cpp]
    }

    /// Parse a language from string (case-insensitive, common aliases accepted)
    pub fn parse(s: &str) -> Option<Language> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" | "python3" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            "java" => Some(Language::Java),
            "cpp" | "c++" | "cxx" => Some(Language::Cpp),
            _ => None,
        }
    }

    pub fn spec(&self) -> &'static LanguageSpec {
        // The table is indexed in variant order.
        &REGISTRY[*self as usize]
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::JavaScript => write!(f, "javascript"),
            Language::Java => write!(f, "java"),
            Language::Cpp => write!(f, "cpp"),
        }
    }
}

/// Look up the toolchain for a language id.
pub fn resolve(id: &str) -> Result<&'static LanguageSpec, UnsupportedLanguage> {
    Language::parse(id)
        .map(|language| language.spec())
        .ok_or_else(|| UnsupportedLanguage(id.to_string()))
}

/// Every registered toolchain, in variant order.
pub fn all() -> &'static [LanguageSpec] {
    &REGISTRY
}
