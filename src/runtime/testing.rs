// src/runtime/testing.rs
//! Scripted stand-in for the Python environment
//!
//! Understands one command per line:
//!
//! ```text
//! print <text>          stdout line
//! eprint <text>         stderr line
//! sleep <ms>            suspend
//! image <json>          emit an image
//! call <name> <json[]>  bridged host call; its reply becomes the value
//! raise <message>       fail the script
//! read <path>           file contents from the virtual filesystem
//! a + b                 integer sum
//! <json>                literal value
//! ```
//!
//! The value of the last line is the script's result.

use crate::runtime::interpreter::{ExecOutcome, ExecutionSink, InstallReport, Interpreter};
use crate::runtime::script::PREAMBLE;
use crate::runtime::session::EnvironmentLauncher;
use crate::runtime::vfs::VirtualFs;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters shared by a launcher and every environment it creates
#[derive(Default)]
pub struct ScriptedStats {
    pub launches: AtomicUsize,
    pub installs: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    /// `start:<script>` / `end:<script>` in the order they happened
    pub log: Mutex<Vec<String>>,
}

impl ScriptedStats {
    pub fn executions(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|entry| entry.strip_prefix("start:").map(str::to_string))
            .collect()
    }
}

pub struct ScriptedLauncher {
    root: PathBuf,
    stats: Arc<ScriptedStats>,
    launch_delay: Duration,
    fail_first: usize,
}

impl ScriptedLauncher {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            stats: Arc::new(ScriptedStats::default()),
            launch_delay: Duration::ZERO,
            fail_first: 0,
        }
    }

    pub fn with_launch_delay_ms(mut self, ms: u64) -> Self {
        self.launch_delay = Duration::from_millis(ms);
        self
    }

    /// Make the first `n` launches fail
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn stats(&self) -> Arc<ScriptedStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl EnvironmentLauncher for ScriptedLauncher {
    async fn launch(&self) -> Result<Arc<dyn Interpreter>> {
        let attempt = self.stats.launches.fetch_add(1, Ordering::SeqCst);
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        if attempt < self.fail_first {
            return Err(EngineError::InitializationFailed("scripted launch failure".into()));
        }
        let fs = VirtualFs::open(&self.root).await?;
        Ok(Arc::new(ScriptedInterpreter {
            fs,
            stats: Arc::clone(&self.stats),
        }))
    }
}

pub struct ScriptedInterpreter {
    fs: VirtualFs,
    stats: Arc<ScriptedStats>,
}

impl ScriptedInterpreter {
    async fn interpret(&self, body: &str, sink: &dyn ExecutionSink) -> ExecOutcome {
        let mut last = Value::Null;
        for line in body.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            last = match command {
                "print" => {
                    sink.stdout(rest.to_string());
                    Value::Null
                }
                "eprint" => {
                    sink.stderr(rest.to_string());
                    Value::Null
                }
                "sleep" => {
                    let ms = rest.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Value::Null
                }
                "image" => {
                    sink.image(serde_json::from_str(rest).unwrap_or(Value::Null));
                    Value::Null
                }
                "call" => {
                    let (name, args) = rest.split_once(' ').unwrap_or((rest, "[]"));
                    let args = serde_json::from_str(args).unwrap_or_default();
                    match sink.call_host(name.to_string(), args).await {
                        Ok(value) => value,
                        Err(message) => return failure(&message),
                    }
                }
                "raise" => return failure(rest),
                "read" => match self.fs.read_file(rest).await {
                    Ok(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
                    Err(e) => return failure(&e.to_string()),
                },
                _ => match evaluate(line) {
                    Some(value) => value,
                    None => return failure(&format!("SyntaxError: cannot evaluate '{}'", line)),
                },
            };
        }
        ExecOutcome::Success {
            result_json: last.to_string(),
        }
    }
}

fn failure(message: &str) -> ExecOutcome {
    ExecOutcome::Failure {
        message: format!("Traceback (most recent call last):\nRuntimeError: {}", message),
    }
}

fn evaluate(expression: &str) -> Option<Value> {
    if let Some((a, b)) = expression.split_once(" + ") {
        let a: i64 = a.trim().parse().ok()?;
        let b: i64 = b.trim().parse().ok()?;
        return Some(Value::from(a + b));
    }
    serde_json::from_str(expression).ok()
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    fn filesystem(&self) -> &VirtualFs {
        &self.fs
    }

    async fn install_packages(&self, _code: &str, _sink: &dyn ExecutionSink) -> Result<InstallReport> {
        self.stats.installs.fetch_add(1, Ordering::SeqCst);
        Ok(InstallReport::default())
    }

    async fn execute(&self, code: &str, sink: &dyn ExecutionSink) -> Result<ExecOutcome> {
        let body = code.strip_prefix(PREAMBLE).unwrap_or(code).trim_start_matches('\n');

        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(active, Ordering::SeqCst);
        self.stats.log.lock().push(format!("start:{}", body));

        let outcome = self.interpret(body, sink).await;

        self.stats.log.lock().push(format!("end:{}", body));
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }
}
