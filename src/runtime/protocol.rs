// src/runtime/protocol.rs
//! Messages crossing the host/sandbox boundary
//!
//! Two vocabularies live here:
//!
//! - [`HostMessage`] / [`WorkerMessage`]: the host talks to the sandbox
//!   worker with these. Both are closed tagged enums; decoding rejects any
//!   unknown `type` instead of silently ignoring it.
//! - [`DriverRequest`] / [`DriverEvent`]: newline-delimited JSON spoken
//!   between the worker and the interpreter process it drives.

use crate::utils::errors::{EngineError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Interpreter status reported for every task, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterStatus {
    Idle,
    Loading,
    Installing,
    Running,
    Completed,
    Failed,
}

impl InterpreterStatus {
    /// `completed` and `failed` end a task
    pub fn is_terminal(&self) -> bool {
        matches!(self, InterpreterStatus::Completed | InterpreterStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InterpreterStatus::Idle => "idle",
            InterpreterStatus::Loading => "loading",
            InterpreterStatus::Installing => "installing",
            InterpreterStatus::Running => "running",
            InterpreterStatus::Completed => "completed",
            InterpreterStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InterpreterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of one auxiliary file: inline text, or bytes carried as base64
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuxiliaryFile {
    Text(String),
    Binary { base64: String },
}

impl AuxiliaryFile {
    /// Wrap raw bytes for transport
    pub fn from_bytes(bytes: &[u8]) -> Self {
        AuxiliaryFile::Binary {
            base64: BASE64.encode(bytes),
        }
    }

    /// Decode into the bytes that land on the virtual filesystem
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            AuxiliaryFile::Text(text) => Ok(text.as_bytes().to_vec()),
            AuxiliaryFile::Binary { base64 } => BASE64
                .decode(base64.as_bytes())
                .map_err(|e| EngineError::Protocol(format!("invalid base64 payload: {}", e))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            AuxiliaryFile::Text(text) => Value::String(text.clone()),
            AuxiliaryFile::Binary { base64 } => {
                let mut map = serde_json::Map::new();
                map.insert("base64".to_string(), Value::String(base64.clone()));
                Value::Object(map)
            }
        }
    }
}

/// Auxiliary files keyed by path relative to the virtual filesystem root
pub type AuxiliaryFiles = BTreeMap<String, AuxiliaryFile>;

/// Host → sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    #[serde(rename = "run")]
    Run {
        code: String,
        #[serde(
            rename = "additionalFiles",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        additional_files: Option<AuxiliaryFiles>,
    },

    /// Historical variant; the worker only logs the announcement
    #[serde(rename = "registerAsyncFunction")]
    RegisterAsyncFunction { name: String, id: String },

    #[serde(rename = "asyncFunctionResult")]
    AsyncFunctionResult {
        id: String,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

const HOST_MESSAGE_TYPES: &[&str] = &["run", "registerAsyncFunction", "asyncFunctionResult"];

impl HostMessage {
    pub fn decode(text: &str) -> Result<Self> {
        decode_tagged(text, "type", HOST_MESSAGE_TYPES)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Sandbox → host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    #[serde(rename = "stdout")]
    Stdout { data: String },

    #[serde(rename = "stderr")]
    Stderr { data: String },

    #[serde(rename = "setStatus")]
    SetStatus { status: InterpreterStatus },

    #[serde(rename = "addImage")]
    AddImage { image: Value },

    #[serde(rename = "setResultJson")]
    SetResultJson {
        #[serde(rename = "resultJson")]
        result_json: String,
    },

    #[serde(rename = "callAsyncFunction")]
    CallAsyncFunction {
        id: String,
        name: String,
        args: Vec<Value>,
    },
}

const WORKER_MESSAGE_TYPES: &[&str] = &[
    "stdout",
    "stderr",
    "setStatus",
    "addImage",
    "setResultJson",
    "callAsyncFunction",
];

impl WorkerMessage {
    pub fn decode(text: &str) -> Result<Self> {
        decode_tagged(text, "type", WORKER_MESSAGE_TYPES)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Worker → interpreter process, one JSON object per line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DriverRequest {
    /// Resolve the script's imports plus the baseline set
    Install {
        code: String,
        baseline: Vec<String>,
        #[serde(rename = "installMissing")]
        install_missing: bool,
        target: String,
    },

    /// Run a script and report its final expression value
    Exec { code: String, filename: String },

    /// Reply to a `callAsyncFunction` event with the same `seq`
    CallResult {
        seq: u64,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl DriverRequest {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Interpreter process → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DriverEvent {
    #[serde(rename = "ready")]
    Ready { python: String },

    #[serde(rename = "stdout")]
    Stdout { data: String },

    #[serde(rename = "stderr")]
    Stderr { data: String },

    #[serde(rename = "addImage")]
    AddImage { image: Value },

    #[serde(rename = "callAsyncFunction")]
    CallAsyncFunction {
        seq: u64,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    #[serde(rename = "installed")]
    Installed {
        #[serde(default)]
        installed: Vec<String>,
        #[serde(default)]
        missing: Vec<String>,
    },

    #[serde(rename = "execResult")]
    ExecResult {
        #[serde(rename = "resultJson")]
        result_json: String,
    },

    #[serde(rename = "execError")]
    ExecError { message: String },
}

const DRIVER_EVENT_TYPES: &[&str] = &[
    "ready",
    "stdout",
    "stderr",
    "addImage",
    "callAsyncFunction",
    "installed",
    "execResult",
    "execError",
];

impl DriverEvent {
    pub fn decode(text: &str) -> Result<Self> {
        decode_tagged(text, "type", DRIVER_EVENT_TYPES)
    }
}

/// Validate the tag against a closed set before handing the object to serde,
/// so an unknown tag reports as such rather than as a shape mismatch.
fn decode_tagged<T>(text: &str, tag: &str, known: &[&str]) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let value: Value = serde_json::from_str(text)
        .map_err(|e| EngineError::Protocol(format!("malformed message: {}", e)))?;

    let kind = match value.as_object().and_then(|obj| obj.get(tag)) {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(EngineError::Protocol(format!("'{}' must be a string", tag))),
        None => return Err(EngineError::Protocol(format!("message has no '{}'", tag))),
    };

    if !known.contains(&kind.as_str()) {
        return Err(EngineError::Protocol(format!("unknown message {} '{}'", tag, kind)));
    }

    serde_json::from_value(value)
        .map_err(|e| EngineError::Protocol(format!("invalid '{}' message: {}", kind, e)))
}
