// src/runtime/bridge.rs
//! Async capability bridge
//!
//! Lets a sandboxed script await a function that lives on the host. The
//! sandbox side ([`AsyncBridge`]) parks each call under a fresh random id and
//! posts `callAsyncFunction`; the host side ([`HostFunctionRegistry`]) runs
//! the named function and posts back `asyncFunctionResult` with the same id.
//!
//! Calls have no timeout. A host function that never answers leaves the
//! script suspended.

use crate::observability::BRIDGE_CALLS;
use crate::runtime::protocol::WorkerMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Outcome of a bridged call: a JSON value or an error message
pub type CallResult = std::result::Result<Value, String>;

/// A host-side function callable from the sandbox
#[async_trait]
pub trait HostFunction: Send + Sync {
    async fn call(&self, args: Vec<Value>) -> CallResult;
}

struct FnHostFunction<F>(F);

#[async_trait]
impl<F, Fut> HostFunction for FnHostFunction<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = CallResult> + Send,
{
    async fn call(&self, args: Vec<Value>) -> CallResult {
        (self.0)(args).await
    }
}

/// Host functions by name
#[derive(Default)]
pub struct HostFunctionRegistry {
    functions: DashMap<String, Arc<dyn HostFunction>>,
}

impl HostFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `name`, replacing any previous one
    pub fn register(&self, name: impl Into<String>, function: Arc<dyn HostFunction>) {
        self.functions.insert(name.into(), function);
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        self.register(name, Arc::new(FnHostFunction(function)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Run the function registered as `name`
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> CallResult {
        // Clone out of the map so no shard lock is held across the await
        let function = self.functions.get(name).map(|entry| Arc::clone(entry.value()));
        match function {
            Some(function) => {
                metrics::counter!(BRIDGE_CALLS).increment(1);
                function.call(args).await
            }
            None => Err(format!("no host function registered as '{}'", name)),
        }
    }
}

/// Sandbox-side half of the bridge
pub struct AsyncBridge {
    pending: DashMap<String, oneshot::Sender<CallResult>>,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
}

impl AsyncBridge {
    pub fn new(outbound: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            pending: DashMap::new(),
            outbound,
        }
    }

    /// Call host function `name` and wait for its reply
    pub async fn call(&self, name: &str, args: Vec<Value>) -> CallResult {
        let id = new_call_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id.clone(), reply_tx);

        let request = WorkerMessage::CallAsyncFunction {
            id: id.clone(),
            name: name.to_string(),
            args,
        };
        if self.outbound.send(request).is_err() {
            self.pending.remove(&id);
            return Err("host is no longer listening".into());
        }

        debug!("Bridged call {} awaiting reply {}", name, id);
        reply_rx
            .await
            .unwrap_or_else(|_| Err("bridged call was abandoned".into()))
    }

    /// Settle the pending call `id`. Returns false for an unknown id.
    pub fn resolve(&self, id: &str, result: Value, error: Option<String>) -> bool {
        match self.pending.remove(id) {
            Some((_, reply)) => {
                let outcome = match error {
                    Some(error) => Err(error),
                    None => Ok(result),
                };
                let _ = reply.send(outcome);
                true
            }
            None => {
                debug!("Ignoring reply for unknown bridged call {}", id);
                false
            }
        }
    }

    /// Calls still waiting for a reply
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn new_call_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
