// src/runtime/mod.rs
//! Sandboxed script execution
//!
//! This module provides the execution subsystem:
//!
//! - **Task Queue**: strict FIFO, one task at a time, per-task observers
//! - **Worker**: the sandbox side of the message boundary
//! - **Session**: the lazily started, never torn down environment
//! - **Interpreter**: the Python child process and its JSON-lines driver
//! - **Bridge**: host functions callable from sandboxed scripts
//! - **Sandbox**: OS resource limits for the interpreter process
//!
//! # Architecture
//!
//! ```text
//!   callers ──queue_task──▶ TaskQueue (dispatcher)
//!                              │  ▲
//!                 HostMessage  │  │  WorkerMessage
//!                              ▼  │
//!                            Worker ◀──── AsyncBridge replies
//!                              │
//!                           Session ──▶ PythonInterpreter ──▶ python3 -u driver
//! ```

pub mod assets;
pub mod bridge;
pub mod interpreter;
pub mod process_manager;
pub mod protocol;
pub mod queue;
pub mod sandbox;
pub mod script;
pub mod session;
pub mod vfs;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use bridge::{HostFunction, HostFunctionRegistry};
pub use interpreter::{ExecOutcome, ExecutionSink, Interpreter, PythonInterpreter};
pub use protocol::{AuxiliaryFile, AuxiliaryFiles, HostMessage, InterpreterStatus, WorkerMessage};
pub use queue::{LoggingObserver, TaskObserver, TaskQueue, TaskState};
pub use sandbox::{Sandbox, SandboxConfig};
pub use script::strip_main_section;
pub use session::{EnvironmentLauncher, PythonLauncher, RuntimeConfig, Session};
