// src/runtime/queue.rs
//! Task queue: the single entry point for running scripts
//!
//! All requests funnel through one dispatcher task that owns the FIFO and
//! talks to the one worker. At most one task is dispatched at a time; the
//! next one goes out only after the current one reports `completed` or
//! `failed`. Each task's observer sees its stdout/stderr/status/image events
//! in order, and only while the task is at the head of the queue.
//!
//! Tasks never time out. A caller wanting a deadline races the returned
//! future against a timer; the task itself still runs to the end.

use crate::observability::{QUEUE_DEPTH, TASKS_COMPLETED, TASKS_ENQUEUED, TASKS_FAILED, TASK_DURATION};
use crate::runtime::bridge::HostFunctionRegistry;
use crate::runtime::protocol::{AuxiliaryFiles, HostMessage, InterpreterStatus, WorkerMessage};
use crate::runtime::session::Session;
use crate::runtime::worker::{spawn_worker, WorkerHandle};
use crate::utils::errors::{EngineError, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Callbacks for one task. All methods default to doing nothing.
pub trait TaskObserver: Send + Sync {
    fn on_stdout(&self, _data: &str) {}

    fn on_stderr(&self, _data: &str) {}

    fn on_status(&self, _status: InterpreterStatus) {}

    fn on_image(&self, _image: &Value) {}
}

/// Forwards script output to the log
pub struct LoggingObserver;

impl TaskObserver for LoggingObserver {
    fn on_stdout(&self, data: &str) {
        info!(target: "sandbox_engine::script", "{}", data);
    }

    fn on_stderr(&self, data: &str) {
        warn!(target: "sandbox_engine::script", "{}", data);
    }

    fn on_status(&self, status: InterpreterStatus) {
        debug!("status {}", status);
    }
}

/// Lifecycle of a queued task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Loading,
    Installing,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// Move to the state named by `status`. Returns false when the
    /// transition is out of order; the state is updated either way.
    pub fn advance(&mut self, status: InterpreterStatus) -> bool {
        let next = match status {
            InterpreterStatus::Idle => return *self == TaskState::Queued,
            InterpreterStatus::Loading => TaskState::Loading,
            InterpreterStatus::Installing => TaskState::Installing,
            InterpreterStatus::Running => TaskState::Running,
            InterpreterStatus::Completed => TaskState::Completed,
            InterpreterStatus::Failed => TaskState::Failed,
        };

        let valid = matches!(
            (*self, next),
            (TaskState::Queued, TaskState::Loading)
                | (TaskState::Loading, TaskState::Installing)
                | (TaskState::Loading, TaskState::Failed)
                | (TaskState::Installing, TaskState::Running)
                | (TaskState::Installing, TaskState::Failed)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
        );
        *self = next;
        valid
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

struct Task {
    id: String,
    code: String,
    files: Option<AuxiliaryFiles>,
    observer: Arc<dyn TaskObserver>,
    reply: oneshot::Sender<Result<Value>>,
    state: TaskState,
    dispatched_at: Option<Instant>,
}

enum Command {
    Enqueue(Task),
}

/// Handle to the queue; cheap to clone
#[derive(Clone)]
pub struct TaskQueue {
    commands: mpsc::UnboundedSender<Command>,
    dispatched: Arc<AtomicU64>,
}

impl TaskQueue {
    /// Start a worker on `session` and a dispatcher in front of it
    pub fn start(session: Arc<Session>, registry: Arc<HostFunctionRegistry>) -> Self {
        Self::with_worker(spawn_worker(session), registry)
    }

    /// Put a dispatcher in front of an existing worker
    pub fn with_worker(worker: WorkerHandle, registry: Arc<HostFunctionRegistry>) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let dispatched = Arc::new(AtomicU64::new(0));
        let (to_worker, from_worker, _runner) = worker.into_parts();

        let dispatcher = Dispatcher {
            tasks: VecDeque::new(),
            running: false,
            current_result: None,
            to_worker,
            registry,
            dispatched: Arc::clone(&dispatched),
            worker_gone: false,
        };
        tokio::spawn(dispatcher.run(commands_rx, from_worker));

        Self {
            commands,
            dispatched,
        }
    }

    /// Queue `code` for execution
    ///
    /// The task is enqueued before this returns, so call order is dispatch
    /// order even if the futures are awaited later or not at all. Resolves
    /// with the script's value, or rejects with [`EngineError::ScriptFailed`]
    /// (the details having gone to `observer.on_stderr`).
    pub fn queue_task(
        &self,
        code: impl Into<String>,
        observer: Arc<dyn TaskObserver>,
        files: Option<AuxiliaryFiles>,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        self.submit(code.into(), observer, files)
    }

    fn submit(
        &self,
        code: String,
        observer: Arc<dyn TaskObserver>,
        files: Option<AuxiliaryFiles>,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        let (reply, reply_rx) = oneshot::channel();
        let task = Task {
            id: ulid::Ulid::new().to_string(),
            code,
            files,
            observer,
            reply,
            state: TaskState::Queued,
            dispatched_at: None,
        };
        // A closed dispatcher drops the task, and with it the reply sender
        let _ = self.commands.send(Command::Enqueue(task));

        async move { reply_rx.await.unwrap_or(Err(EngineError::WorkerGone)) }
    }

    /// Number of tasks handed to the worker so far
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }
}

struct Dispatcher {
    tasks: VecDeque<Task>,
    running: bool,
    current_result: Option<Value>,
    to_worker: mpsc::UnboundedSender<String>,
    registry: Arc<HostFunctionRegistry>,
    dispatched: Arc<AtomicU64>,
    worker_gone: bool,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut from_worker: mpsc::UnboundedReceiver<String>,
    ) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Enqueue(task)) => self.enqueue(task),
                    None => commands_open = false,
                },
                text = from_worker.recv(), if !self.worker_gone => match text {
                    Some(text) => self.handle_worker_message(&text),
                    None => self.fail_all("worker channel closed"),
                },
                else => break,
            }

            if !commands_open && self.tasks.is_empty() {
                break;
            }
        }
        debug!("Task queue dispatcher stopped");
    }

    fn enqueue(&mut self, task: Task) {
        if self.worker_gone {
            let _ = task.reply.send(Err(EngineError::WorkerGone));
            return;
        }
        debug!("Task {} queued behind {} other(s)", task.id, self.tasks.len());
        self.tasks.push_back(task);
        metrics::counter!(TASKS_ENQUEUED).increment(1);
        metrics::gauge!(QUEUE_DEPTH).set(self.tasks.len() as f64);
        self.dispatch_next();
    }

    fn dispatch_next(&mut self) {
        if self.running {
            return;
        }
        let Some(task) = self.tasks.front_mut() else {
            return;
        };

        let message = HostMessage::Run {
            code: task.code.clone(),
            additional_files: task.files.clone().filter(|files| !files.is_empty()),
        };
        let encoded = match message.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode task {}: {}", task.id, e);
                self.running = true;
                self.complete_current(true);
                return;
            }
        };

        debug!("Dispatching task {}", task.id);
        task.dispatched_at = Some(Instant::now());
        self.running = true;
        self.current_result = None;
        self.dispatched.fetch_add(1, Ordering::SeqCst);

        if self.to_worker.send(encoded).is_err() {
            self.fail_all("worker stopped accepting tasks");
        }
    }

    fn handle_worker_message(&mut self, text: &str) {
        let message = match WorkerMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                error!("Invalid message from worker: {}", e);
                return;
            }
        };

        // Bridged calls are served whether or not a task is current
        if let WorkerMessage::CallAsyncFunction { id, name, args } = message {
            self.serve_call(id, name, args);
            return;
        }

        let Some(task) = self.tasks.front_mut().filter(|_| self.running) else {
            debug!("Dropping worker message with no active task");
            return;
        };

        match message {
            WorkerMessage::Stdout { data } => task.observer.on_stdout(&data),
            WorkerMessage::Stderr { data } => task.observer.on_stderr(&data),
            WorkerMessage::AddImage { image } => task.observer.on_image(&image),
            WorkerMessage::SetResultJson { result_json } => {
                match serde_json::from_str(&result_json) {
                    Ok(value) => self.current_result = Some(value),
                    Err(e) => warn!("Task {} sent unreadable result JSON: {}", task.id, e),
                }
            }
            WorkerMessage::SetStatus { status } => {
                if !task.state.advance(status) {
                    warn!("Task {} moved to {} out of order", task.id, status);
                }
                task.observer.on_status(status);
                let failed = task.state == TaskState::Failed;
                if task.state.is_terminal() {
                    self.complete_current(failed);
                }
            }
            WorkerMessage::CallAsyncFunction { .. } => {}
        }
    }

    fn serve_call(&self, id: String, name: String, args: Vec<Value>) {
        let registry = Arc::clone(&self.registry);
        let to_worker = self.to_worker.clone();
        tokio::spawn(async move {
            let reply = match registry.invoke(&name, args).await {
                Ok(result) => HostMessage::AsyncFunctionResult {
                    id,
                    result,
                    error: None,
                },
                Err(error) => {
                    warn!("Host function {} failed: {}", name, error);
                    HostMessage::AsyncFunctionResult {
                        id,
                        result: Value::Null,
                        error: Some(error),
                    }
                }
            };
            match reply.encode() {
                Ok(text) => {
                    let _ = to_worker.send(text);
                }
                Err(e) => error!("Failed to encode reply for {}: {}", name, e),
            }
        });
    }

    /// Settle the head task, then dispatch the next one
    fn complete_current(&mut self, failed: bool) {
        let Some(task) = self.tasks.pop_front() else {
            return;
        };
        self.running = false;
        let result = self.current_result.take().unwrap_or(Value::Null);

        if let Some(dispatched_at) = task.dispatched_at {
            metrics::histogram!(TASK_DURATION).record(dispatched_at.elapsed().as_secs_f64());
        }
        metrics::gauge!(QUEUE_DEPTH).set(self.tasks.len() as f64);

        let outcome = if failed {
            metrics::counter!(TASKS_FAILED).increment(1);
            debug!("Task {} failed", task.id);
            Err(EngineError::ScriptFailed)
        } else {
            metrics::counter!(TASKS_COMPLETED).increment(1);
            debug!("Task {} completed", task.id);
            Ok(result)
        };
        // The caller may have stopped waiting
        let _ = task.reply.send(outcome);

        self.dispatch_next();
    }

    fn fail_all(&mut self, reason: &str) {
        if !self.tasks.is_empty() {
            error!("Failing {} task(s): {}", self.tasks.len(), reason);
        }
        self.worker_gone = true;
        self.running = false;
        for task in self.tasks.drain(..) {
            let _ = task.reply.send(Err(EngineError::WorkerGone));
        }
        metrics::gauge!(QUEUE_DEPTH).set(0.0);
    }
}
