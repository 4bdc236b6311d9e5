// src/runtime/worker.rs
//! The sandbox side of the host/sandbox boundary
//!
//! The worker runs as its own set of tasks and talks to the host only by
//! JSON text messages: [`HostMessage`] in, [`WorkerMessage`] out. One
//! router task receives host messages and feeds bridge replies straight to
//! the [`AsyncBridge`], so replies land while a script is blocked on a
//! bridged call. Scripts run one after another on a separate runner task.

use crate::runtime::bridge::{AsyncBridge, CallResult};
use crate::runtime::interpreter::{ExecOutcome, ExecutionSink, Interpreter};
use crate::runtime::protocol::{AuxiliaryFiles, HostMessage, InterpreterStatus, WorkerMessage};
use crate::runtime::script::compose_script;
use crate::runtime::session::Session;
use crate::runtime::vfs::MaterializedFiles;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Host-side ends of a running worker
pub struct WorkerHandle {
    /// Encoded [`HostMessage`]s for the worker
    pub to_worker: mpsc::UnboundedSender<String>,
    /// Encoded [`WorkerMessage`]s from the worker
    pub from_worker: mpsc::UnboundedReceiver<String>,
    runner: JoinHandle<()>,
}

impl WorkerHandle {
    /// Build a handle from raw channel ends
    pub fn from_parts(
        to_worker: mpsc::UnboundedSender<String>,
        from_worker: mpsc::UnboundedReceiver<String>,
        runner: JoinHandle<()>,
    ) -> Self {
        Self {
            to_worker,
            from_worker,
            runner,
        }
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
        JoinHandle<()>,
    ) {
        (self.to_worker, self.from_worker, self.runner)
    }
}

/// Sends [`WorkerMessage`]s toward the host
#[derive(Clone)]
struct Outbox {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl Outbox {
    fn send(&self, message: WorkerMessage) {
        if self.tx.send(message).is_err() {
            debug!("Host is gone; dropping worker message");
        }
    }

    fn status(&self, status: InterpreterStatus) {
        self.send(WorkerMessage::SetStatus { status });
    }

    fn stderr(&self, data: String) {
        self.send(WorkerMessage::Stderr { data });
    }
}

struct RunRequest {
    code: String,
    files: AuxiliaryFiles,
}

/// Start a worker bound to `session`
pub fn spawn_worker(session: Arc<Session>) -> WorkerHandle {
    let (to_worker_tx, mut to_worker_rx) = mpsc::unbounded_channel::<String>();
    let (from_worker_tx, from_worker_rx) = mpsc::unbounded_channel::<String>();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let (run_tx, mut run_rx) = mpsc::unbounded_channel::<RunRequest>();

    let bridge = Arc::new(AsyncBridge::new(outbox_tx.clone()));
    let outbox = Outbox { tx: outbox_tx };

    // Encode everything the worker emits onto the text channel
    tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            match message.encode() {
                Ok(text) => {
                    if from_worker_tx.send(text).is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to encode worker message: {}", e),
            }
        }
    });

    let router_bridge = Arc::clone(&bridge);
    tokio::spawn(async move {
        while let Some(text) = to_worker_rx.recv().await {
            match HostMessage::decode(&text) {
                Ok(HostMessage::Run {
                    code,
                    additional_files,
                }) => {
                    let request = RunRequest {
                        code,
                        files: additional_files.unwrap_or_default(),
                    };
                    if run_tx.send(request).is_err() {
                        break;
                    }
                }
                Ok(HostMessage::AsyncFunctionResult { id, result, error }) => {
                    router_bridge.resolve(&id, result, error);
                }
                Ok(HostMessage::RegisterAsyncFunction { name, id }) => {
                    debug!("Host announced async function {} ({})", name, id);
                }
                Err(e) => warn!("Worker rejected host message: {}", e),
            }
        }
        debug!("Host closed the worker channel");
    });

    let runner = tokio::spawn(async move {
        while let Some(request) = run_rx.recv().await {
            run_script(&session, &bridge, &outbox, request).await;
        }
    });

    WorkerHandle::from_parts(to_worker_tx, from_worker_rx, runner)
}

/// Run one script through the full status sequence
///
/// Always ends with exactly one terminal status.
async fn run_script(session: &Session, bridge: &Arc<AsyncBridge>, outbox: &Outbox, request: RunRequest) {
    outbox.status(InterpreterStatus::Loading);

    let environment = match session.get_environment().await {
        Ok(environment) => environment,
        Err(e) => {
            outbox.stderr(format!("UNEXPECTED ERROR: {}", e));
            outbox.status(InterpreterStatus::Failed);
            return;
        }
    };

    let sink = WorkerSink {
        outbox: outbox.clone(),
        bridge: Arc::clone(bridge),
    };

    let mut written = MaterializedFiles::default();
    let succeeded = match execute_task(environment.as_ref(), &sink, outbox, &request, &mut written).await {
        Ok(succeeded) => succeeded,
        Err(e) => {
            outbox.stderr(e.to_string());
            false
        }
    };

    if !written.is_empty() {
        let failures = environment.filesystem().cleanup(&written).await;
        if failures > 0 {
            warn!("{} auxiliary file(s) could not be removed", failures);
        }
    }

    outbox.status(if succeeded {
        InterpreterStatus::Completed
    } else {
        InterpreterStatus::Failed
    });
}

async fn execute_task(
    environment: &dyn Interpreter,
    sink: &WorkerSink,
    outbox: &Outbox,
    request: &RunRequest,
    written: &mut MaterializedFiles,
) -> Result<bool> {
    outbox.status(InterpreterStatus::Installing);
    environment.install_packages(&request.code, sink).await?;

    environment
        .filesystem()
        .materialize(&request.files, written)
        .await?;

    outbox.status(InterpreterStatus::Running);
    match environment.execute(&compose_script(&request.code), sink).await? {
        ExecOutcome::Success { result_json } => {
            serde_json::from_str::<Value>(&result_json).map_err(|e| {
                EngineError::Protocol(format!("interpreter produced invalid result JSON: {}", e))
            })?;
            outbox.send(WorkerMessage::SetResultJson { result_json });
            Ok(true)
        }
        ExecOutcome::Failure { message } => {
            outbox.stderr(message);
            Ok(false)
        }
    }
}

struct WorkerSink {
    outbox: Outbox,
    bridge: Arc<AsyncBridge>,
}

#[async_trait]
impl ExecutionSink for WorkerSink {
    fn stdout(&self, data: String) {
        self.outbox.send(WorkerMessage::Stdout { data });
    }

    fn stderr(&self, data: String) {
        self.outbox.send(WorkerMessage::Stderr { data });
    }

    fn image(&self, image: Value) {
        self.outbox.send(WorkerMessage::AddImage { image });
    }

    async fn call_host(&self, name: String, args: Vec<Value>) -> CallResult {
        self.bridge.call(&name, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::protocol::AuxiliaryFile;
    use crate::runtime::testing::ScriptedLauncher;
    use serde_json::json;

    async fn run_to_end(handle: &mut WorkerHandle, message: HostMessage) -> Vec<WorkerMessage> {
        handle.to_worker.send(message.encode().unwrap()).unwrap();
        let mut seen = Vec::new();
        while let Some(text) = handle.from_worker.recv().await {
            let message = WorkerMessage::decode(&text).unwrap();
            let terminal = matches!(&message, WorkerMessage::SetStatus { status } if status.is_terminal());
            seen.push(message);
            if terminal {
                break;
            }
        }
        seen
    }

    fn statuses(messages: &[WorkerMessage]) -> Vec<InterpreterStatus> {
        messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::SetStatus { status } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_run_reports_result() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::new(ScriptedLauncher::new(dir.path())));
        let mut handle = spawn_worker(session);

        let messages = run_to_end(
            &mut handle,
            HostMessage::Run {
                code: "print hi\n1 + 1".into(),
                additional_files: None,
            },
        )
        .await;

        assert_eq!(
            statuses(&messages),
            vec![
                InterpreterStatus::Loading,
                InterpreterStatus::Installing,
                InterpreterStatus::Running,
                InterpreterStatus::Completed
            ]
        );
        assert!(messages.contains(&WorkerMessage::Stdout { data: "hi".into() }));
        assert!(messages.contains(&WorkerMessage::SetResultJson { result_json: "2".into() }));
    }

    #[tokio::test]
    async fn test_announcement_is_not_answered() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::new(ScriptedLauncher::new(dir.path())));
        let mut handle = spawn_worker(session);

        let announce = HostMessage::RegisterAsyncFunction {
            name: "fetch".into(),
            id: "a1".into(),
        };
        handle.to_worker.send(announce.encode().unwrap()).unwrap();
        let messages = run_to_end(
            &mut handle,
            HostMessage::Run {
                code: "1 + 1".into(),
                additional_files: None,
            },
        )
        .await;

        // Only the task's own traffic comes back
        assert!(matches!(
            messages.first(),
            Some(WorkerMessage::SetStatus {
                status: InterpreterStatus::Loading
            })
        ));
        assert!(messages.contains(&WorkerMessage::SetResultJson { result_json: "2".into() }));
    }

    #[tokio::test]
    async fn test_files_removed_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::new(ScriptedLauncher::new(dir.path())));
        let mut handle = spawn_worker(session);

        let mut files = AuxiliaryFiles::new();
        files.insert("inputs/x.txt".into(), AuxiliaryFile::Text("payload".into()));
        let messages = run_to_end(
            &mut handle,
            HostMessage::Run {
                code: "read inputs/x.txt".into(),
                additional_files: Some(files),
            },
        )
        .await;

        assert!(messages.contains(&WorkerMessage::SetResultJson {
            result_json: "\"payload\"".into()
        }));
        assert!(!dir.path().join("inputs/x.txt").exists());
    }

    #[tokio::test]
    async fn test_escaping_path_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::new(ScriptedLauncher::new(dir.path())));
        let mut handle = spawn_worker(session);

        let mut files = AuxiliaryFiles::new();
        files.insert("../outside.txt".into(), AuxiliaryFile::Text("x".into()));
        let messages = run_to_end(
            &mut handle,
            HostMessage::Run {
                code: "1".into(),
                additional_files: Some(files),
            },
        )
        .await;

        assert_eq!(statuses(&messages).last(), Some(&InterpreterStatus::Failed));
        assert!(messages
            .iter()
            .any(|m| matches!(m, WorkerMessage::Stderr { data } if data.contains("outside.txt"))));
    }

    #[tokio::test]
    async fn test_init_failure_reported_on_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::new(ScriptedLauncher::new(dir.path()).failing_first(1)));
        let mut handle = spawn_worker(session);

        let messages = run_to_end(
            &mut handle,
            HostMessage::Run {
                code: "1".into(),
                additional_files: None,
            },
        )
        .await;

        assert_eq!(
            statuses(&messages),
            vec![InterpreterStatus::Loading, InterpreterStatus::Failed]
        );
        assert!(messages
            .iter()
            .any(|m| matches!(m, WorkerMessage::Stderr { data } if data.starts_with("UNEXPECTED ERROR: "))));
    }

    #[tokio::test]
    async fn test_bridge_reply_routed_during_run() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::new(ScriptedLauncher::new(dir.path())));
        let mut handle = spawn_worker(session);

        let run = HostMessage::Run {
            code: "call double [21]".into(),
            additional_files: None,
        };
        handle.to_worker.send(run.encode().unwrap()).unwrap();

        let mut result = None;
        while let Some(text) = handle.from_worker.recv().await {
            match WorkerMessage::decode(&text).unwrap() {
                WorkerMessage::CallAsyncFunction { id, name, args } => {
                    assert_eq!(name, "double");
                    let value = args[0].as_i64().unwrap() * 2;
                    let reply = HostMessage::AsyncFunctionResult {
                        id,
                        result: json!(value),
                        error: None,
                    };
                    handle.to_worker.send(reply.encode().unwrap()).unwrap();
                }
                WorkerMessage::SetResultJson { result_json } => result = Some(result_json),
                WorkerMessage::SetStatus { status } if status.is_terminal() => {
                    assert_eq!(status, InterpreterStatus::Completed);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(result.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_unknown_host_message_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::new(ScriptedLauncher::new(dir.path())));
        let mut handle = spawn_worker(session);

        handle
            .to_worker
            .send(r#"{"type":"reboot"}"#.to_string())
            .unwrap();
        let messages = run_to_end(
            &mut handle,
            HostMessage::Run {
                code: "3".into(),
                additional_files: None,
            },
        )
        .await;
        assert_eq!(statuses(&messages).last(), Some(&InterpreterStatus::Completed));
    }
}
