// src/runtime/interpreter.rs
//! The isolated execution environment
//!
//! A long-lived `python3` child process running an embedded driver. The
//! host speaks newline-delimited JSON to it over stdin/stdout (see
//! [`DriverRequest`] / [`DriverEvent`]); the child's stderr is drained into
//! the debug log.
//!
//! Everything the worker needs from an environment goes through the
//! [`Interpreter`] trait, so the queue and session can be exercised
//! without a real interpreter.

use crate::runtime::assets::AssetCache;
use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
use crate::runtime::protocol::{DriverEvent, DriverRequest};
use crate::runtime::sandbox::{Sandbox, SandboxConfig};
use crate::runtime::script::SCRIPT_FILENAME;
use crate::runtime::session::RuntimeConfig;
use crate::runtime::vfs::VirtualFs;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

const DRIVER_SOURCE: &str = include_str!("driver/sandbox_driver.py");
const HOOKS_SOURCE: &str = include_str!("driver/sandbox_hooks.py");
const BRIDGE_SOURCE: &str = include_str!("driver/host_bridge.py");

/// Directory inside the virtual filesystem for runtime-owned files
pub const RUNTIME_DIR: &str = ".runtime";
const DRIVER_PATH: &str = ".runtime/sandbox_driver.py";
const PACKAGE_TARGET: &str = "site-packages";

/// Longest single protocol line accepted from the driver (images are inline)
const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Receives everything a running script emits
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    fn stdout(&self, data: String);

    fn stderr(&self, data: String);

    fn image(&self, image: Value);

    /// Invoke a host function on behalf of the script
    async fn call_host(&self, name: String, args: Vec<Value>) -> std::result::Result<Value, String>;
}

/// How a script run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// JSON text of the script's final value
    Success { result_json: String },
    /// The script raised; `message` carries the traceback
    Failure { message: String },
}

/// Result of resolving a script's package requirements
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub missing: Vec<String>,
}

/// An initialized execution environment
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// The environment's virtual filesystem
    fn filesystem(&self) -> &VirtualFs;

    /// Make the packages the script imports (plus the baseline set) available
    async fn install_packages(&self, code: &str, sink: &dyn ExecutionSink) -> Result<InstallReport>;

    /// Run a composed script to completion
    async fn execute(&self, code: &str, sink: &dyn ExecutionSink) -> Result<ExecOutcome>;
}

/// A line from the driver, or the marker for one that was too long
#[derive(Debug, PartialEq, Eq)]
enum DriverLine {
    Text(String),
    Oversized,
}

/// [`LinesCodec`] that reports an over-long line as an item, not an error
///
/// The inner codec discards the rest of such a line by itself, so the
/// stream stays in sync and never enters the framed error state.
struct DriverLines(LinesCodec);

impl DriverLines {
    fn new(max_line_bytes: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max_line_bytes))
    }

    fn wrap(
        decoded: std::result::Result<Option<String>, LinesCodecError>,
    ) -> std::result::Result<Option<DriverLine>, LinesCodecError> {
        match decoded {
            Ok(line) => Ok(line.map(DriverLine::Text)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(DriverLine::Oversized)),
            Err(e) => Err(e),
        }
    }
}

impl Decoder for DriverLines {
    type Item = DriverLine;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<DriverLine>, LinesCodecError> {
        Self::wrap(self.0.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<DriverLine>, LinesCodecError> {
        Self::wrap(self.0.decode_eof(buf))
    }
}

/// JSON-lines link to the driver
///
/// Requests and their replies must stay paired. Once a read or write fails,
/// or a reply of the wrong kind turns up, the channel is poisoned and every
/// later call fails with the same reason instead of reading stale replies.
struct Channel<R, W> {
    reader: FramedRead<R, DriverLines>,
    writer: FramedWrite<W, LinesCodec>,
    poisoned: Option<String>,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn new(reader: R, writer: W, max_line_bytes: usize) -> Self {
        Self {
            reader: FramedRead::new(reader, DriverLines::new(max_line_bytes)),
            writer: FramedWrite::new(writer, LinesCodec::new()),
            poisoned: None,
        }
    }

    fn check(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(EngineError::RuntimeError(format!(
                "interpreter channel unusable: {}",
                reason
            ))),
            None => Ok(()),
        }
    }

    fn poison(&mut self, reason: String) -> EngineError {
        warn!("Interpreter channel poisoned: {}", reason);
        self.poisoned = Some(reason.clone());
        EngineError::RuntimeError(reason)
    }

    async fn send(&mut self, request: &DriverRequest) -> Result<()> {
        self.check()?;
        let line = request.encode()?;
        if let Err(e) = self.writer.send(line).await {
            return Err(self.poison(format!("failed to write to interpreter: {}", e)));
        }
        Ok(())
    }

    /// Next event, or `None` when an oversized line was dropped
    async fn next_event(&mut self) -> Result<Option<DriverEvent>> {
        self.check()?;
        loop {
            match self.reader.next().await {
                Some(Ok(DriverLine::Text(line))) => match DriverEvent::decode(&line) {
                    Ok(event) => return Ok(Some(event)),
                    Err(e) => warn!("Dropping unreadable interpreter message: {}", e),
                },
                Some(Ok(DriverLine::Oversized)) => {
                    warn!("Dropping interpreter message longer than the line limit");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(self.poison(format!("failed to read from interpreter: {}", e))),
                None => return Err(self.poison("interpreter process exited".into())),
            }
        }
    }

    /// Forward streaming events to `sink` until a non-streaming event arrives
    async fn pump(&mut self, sink: &dyn ExecutionSink) -> Result<DriverEvent> {
        loop {
            let event = match self.next_event().await? {
                Some(event) => event,
                None => {
                    sink.stderr("interpreter output dropped: message exceeds the size limit".into());
                    continue;
                }
            };
            match event {
                DriverEvent::Stdout { data } => sink.stdout(data),
                DriverEvent::Stderr { data } => sink.stderr(data),
                DriverEvent::AddImage { image } => sink.image(image),
                DriverEvent::CallAsyncFunction { seq, name, args } => {
                    debug!("Bridged call {} ({})", name, seq);
                    let reply = match sink.call_host(name, args).await {
                        Ok(result) => DriverRequest::CallResult {
                            seq,
                            result,
                            error: None,
                        },
                        Err(error) => DriverRequest::CallResult {
                            seq,
                            result: Value::Null,
                            error: Some(error),
                        },
                    };
                    self.send(&reply).await?;
                }
                DriverEvent::Ready { .. } => warn!("Ignoring repeated ready from interpreter"),
                other => return Ok(other),
            }
        }
    }

    /// Fail and poison on a reply that does not answer the pending request
    fn unexpected(&mut self, expected: &str, event: DriverEvent) -> EngineError {
        self.poison(format!("expected {}, got {:?}", expected, event))
    }
}

/// Python child process driven over JSON lines
pub struct PythonInterpreter {
    fs: VirtualFs,
    channel: Mutex<Channel<ChildStdout, ChildStdin>>,
    // Held so the process is killed when the environment is dropped
    _child: Child,
    baseline_packages: Vec<String>,
    install_missing: bool,
}

impl PythonInterpreter {
    /// Cold start: mount bootstrap files, fetch assets, spawn the driver
    pub async fn start(
        config: &RuntimeConfig,
        sandbox: &SandboxConfig,
        assets: &AssetCache,
    ) -> Result<Self> {
        let fs = VirtualFs::open(&config.work_dir).await?;
        fs.mkdir_tree(RUNTIME_DIR).await?;
        fs.write_file(DRIVER_PATH, DRIVER_SOURCE.as_bytes()).await?;
        fs.write_file("sandbox_hooks.py", HOOKS_SOURCE.as_bytes()).await?;
        fs.write_file("host_bridge.py", BRIDGE_SOURCE.as_bytes()).await?;

        let runtime_dir = fs.resolve(RUNTIME_DIR)?;
        for url in &config.assets {
            assets.fetch_into(url, &runtime_dir).await?;
        }

        let sandbox = Sandbox::new(sandbox)?;
        let mut env_vars = config.env_vars.clone();
        env_vars.insert("PYTHONIOENCODING".into(), "utf-8".into());
        env_vars.insert("PYTHONDONTWRITEBYTECODE".into(), "1".into());

        let spawn_config = SpawnConfig {
            program: config.python.clone(),
            args: vec!["-u".into(), DRIVER_PATH.into()],
            work_dir: fs.root().to_path_buf(),
            env_vars,
        };

        let mut manager = ProcessManager::new();
        let mut child = manager.spawn(&spawn_config, &sandbox)?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        let mut channel = Channel::new(stdout, stdin, MAX_LINE_BYTES);

        let python_version = match channel.next_event().await {
            Ok(Some(DriverEvent::Ready { python })) => python,
            Ok(other) => {
                return Err(EngineError::InitializationFailed(format!(
                    "interpreter sent {:?} before ready",
                    other
                )))
            }
            Err(e) => {
                return Err(EngineError::InitializationFailed(format!(
                    "interpreter did not start: {}",
                    e
                )))
            }
        };

        info!(
            "Python {} ready (pid {:?}) in {:?}",
            python_version,
            pid,
            fs.root()
        );

        Ok(Self {
            fs,
            channel: Mutex::new(channel),
            _child: child,
            baseline_packages: config.baseline_packages.clone(),
            install_missing: config.install_missing_packages,
        })
    }
}

#[async_trait]
impl Interpreter for PythonInterpreter {
    fn filesystem(&self) -> &VirtualFs {
        &self.fs
    }

    async fn install_packages(&self, code: &str, sink: &dyn ExecutionSink) -> Result<InstallReport> {
        let mut channel = self.channel.lock().await;
        channel
            .send(&DriverRequest::Install {
                code: code.to_string(),
                baseline: self.baseline_packages.clone(),
                install_missing: self.install_missing,
                target: PACKAGE_TARGET.into(),
            })
            .await?;

        match channel.pump(sink).await? {
            DriverEvent::Installed { installed, missing } => {
                if !installed.is_empty() {
                    info!("Installed packages: {}", installed.join(", "));
                }
                if !missing.is_empty() {
                    warn!("Packages not available: {}", missing.join(", "));
                }
                Ok(InstallReport { installed, missing })
            }
            other => Err(channel.unexpected("install report", other)),
        }
    }

    async fn execute(&self, code: &str, sink: &dyn ExecutionSink) -> Result<ExecOutcome> {
        let mut channel = self.channel.lock().await;
        channel
            .send(&DriverRequest::Exec {
                code: code.to_string(),
                filename: SCRIPT_FILENAME.into(),
            })
            .await?;

        match channel.pump(sink).await? {
            DriverEvent::ExecResult { result_json } => Ok(ExecOutcome::Success { result_json }),
            DriverEvent::ExecError { message } => Ok(ExecOutcome::Failure { message }),
            other => Err(channel.unexpected("execution result", other)),
        }
    }
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "sandbox_engine::interpreter", "{}", line);
    }
}
