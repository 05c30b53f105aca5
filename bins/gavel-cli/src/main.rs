mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gavel_common::SandboxBackend;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gavel-cli")]
#[command(about = "Gavel CLI - Judge submissions locally and manage toolchain images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all supported languages
    ListLangs,

    /// Judge a source file against a test case file
    Run {
        /// Language id or alias (e.g., python, js, c++)
        #[arg(short, long)]
        lang: String,

        /// Path to the source file
        #[arg(short, long)]
        source: PathBuf,

        /// JSON file with [{"input": ..., "expected_output": ...}]
        #[arg(short, long)]
        cases: PathBuf,

        /// Isolation backend (process or docker); defaults to SANDBOX_BACKEND
        #[arg(short, long)]
        backend: Option<SandboxBackend>,

        /// Per-case wall-clock limit in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Print the results as JSON instead of a report
        #[arg(long)]
        json: bool,
    },

    /// Pull toolchain images for the Docker backend
    PullImages {
        /// Only this language
        #[arg(short, long)]
        lang: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ListLangs => {
            commands::list_languages().await?;
        }
        Commands::Run {
            lang,
            source,
            cases,
            backend,
            timeout_ms,
            json,
        } => {
            let all_passed = commands::run_local(&lang, &source, &cases, backend, timeout_ms, json).await?;
            if !all_passed {
                std::process::exit(1);
            }
        }
        Commands::PullImages { lang } => {
            commands::pull_images(lang.as_deref()).await?;
        }
    }

    Ok(())
}
