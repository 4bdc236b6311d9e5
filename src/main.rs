// src/main.rs
//! Sandbox Engine
//!
//! Runs Python scripts through the serialized, cached sandbox pipeline.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sandbox_engine::cache::ResultCache;
use sandbox_engine::facade::{RunOptions, Runner};
use sandbox_engine::observability::{init_metrics, init_tracing};
use sandbox_engine::runtime::protocol::{AuxiliaryFile, AuxiliaryFiles, InterpreterStatus};
use sandbox_engine::runtime::queue::TaskObserver;
use sandbox_engine::runtime::script::strip_main_section;
use sandbox_engine::utils::config::EngineConfig;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "sandbox-engine", version, about = "Run Python scripts in a sandboxed interpreter")]
struct Cli {
    /// Configuration file (defaults to ./sandbox-engine.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a script and print its result as JSON
    Run {
        script: PathBuf,

        /// Auxiliary file as DEST=SRC; DEST is relative to the sandbox root
        #[arg(long = "file", value_name = "DEST=SRC")]
        files: Vec<String>,

        /// Drop the `if __name__ == '__main__':` section before running
        #[arg(long)]
        strip_main: bool,

        #[arg(long)]
        no_read_cache: bool,

        #[arg(long)]
        no_write_cache: bool,

        /// Neither read nor write the remote memo store
        #[arg(long)]
        skip_remote: bool,

        /// Print `{"result", "images"}` as one JSON line
        #[arg(long)]
        json: bool,

        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },

    /// Inspect or clear the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    Stats,
    Clear,
}

/// Echoes script output to the terminal
struct ConsoleObserver;

impl TaskObserver for ConsoleObserver {
    fn on_stdout(&self, data: &str) {
        println!("{}", data);
    }

    fn on_stderr(&self, data: &str) {
        eprintln!("{}", data);
    }

    fn on_status(&self, status: InterpreterStatus) {
        debug!("status: {}", status.as_str());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => EngineConfig::load_from(Some(path)),
        None => EngineConfig::load(),
    }
    .context("failed to load configuration")?;
    init_tracing(config.observability.json_logs)?;

    match cli.command {
        Command::Run {
            script,
            files,
            strip_main,
            no_read_cache,
            no_write_cache,
            skip_remote,
            json,
            metrics,
        } => {
            let handle = if metrics || config.observability.metrics {
                Some(init_metrics()?)
            } else {
                None
            };

            let source = tokio::fs::read_to_string(&script)
                .await
                .with_context(|| format!("failed to read {}", script.display()))?;
            let code = if strip_main {
                strip_main_section(&source).to_string()
            } else {
                source
            };

            let options = RunOptions {
                read_cache: !no_read_cache,
                write_cache: !no_write_cache,
                auxiliary_files: load_auxiliary_files(&files).await?,
                skip_remote,
            };

            info!("Starting Sandbox Engine v{}", sandbox_engine::VERSION);
            let runner = Runner::start(&config).await?;
            register_host_functions(&runner);

            let outcome = runner
                .cached_run(&code, &options, Arc::new(ConsoleObserver))
                .await?;

            if json {
                println!("{}", serde_json::to_string(&outcome)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&outcome.result)?);
                if !outcome.images.is_empty() {
                    eprintln!("({} image(s) produced)", outcome.images.len());
                }
            }
            if metrics {
                if let Some(handle) = handle {
                    print!("{}", handle.render());
                }
            }
        }
        Command::Cache { action } => {
            let cache = ResultCache::open(&config.cache).await?;
            match action {
                CacheAction::Stats => {
                    let stats = cache.stats().await?;
                    println!("entries: {}", stats.entries);
                    println!("total size: {} bytes", stats.total_size_bytes);
                }
                CacheAction::Clear => {
                    let removed = cache.clear().await?;
                    println!("removed {} entries", removed);
                }
            }
        }
    }

    Ok(())
}

async fn load_auxiliary_files(specs: &[String]) -> Result<Option<AuxiliaryFiles>> {
    if specs.is_empty() {
        return Ok(None);
    }

    let mut files = AuxiliaryFiles::new();
    for entry in specs {
        let Some((dest, src)) = entry.split_once('=') else {
            bail!("--file expects DEST=SRC, got '{}'", entry);
        };
        let bytes = tokio::fs::read(src)
            .await
            .with_context(|| format!("failed to read {}", src))?;
        let file = match String::from_utf8(bytes) {
            Ok(text) => AuxiliaryFile::Text(text),
            Err(e) => AuxiliaryFile::from_bytes(e.as_bytes()),
        };
        files.insert(dest.to_string(), file);
    }
    Ok(Some(files))
}

/// Functions scripts can await through `host_bridge.call_async_host`
fn register_host_functions(runner: &Runner) {
    runner
        .registry()
        .register_fn("echo", |args: Vec<Value>| async move { Ok(Value::Array(args)) });
    runner.registry().register_fn("utc_now", |_args: Vec<Value>| async move {
        Ok(Value::String(chrono::Utc::now().to_rfc3339()))
    });
}
