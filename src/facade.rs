// src/facade.rs
//! Caller-facing entry points
//!
//! [`Runner`] wires session, queue, cache and host functions together and
//! offers `run` (queue a script) and `cached_run` (check the cache first,
//! write it after). [`ResultHook`] is the reactive form: feed it the current
//! code and options, watch the `{result, images, status}` it publishes.
//!
//! Lookups go local cache, then the remote memo store (when one is set and
//! the call does not skip it), then the task queue. Writes go local first,
//! then remote.

use crate::cache::{CachedResult, MemobinStore, RemoteStore, ResultCache};
use crate::observability::{REMOTE_HITS, REMOTE_UPLOADS};
use crate::runtime::bridge::HostFunctionRegistry;
use crate::runtime::protocol::{AuxiliaryFiles, InterpreterStatus};
use crate::runtime::queue::{TaskObserver, TaskQueue};
use crate::runtime::session::{PythonLauncher, Session};
use crate::utils::config::EngineConfig;
use crate::utils::errors::Result;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Options for a cached run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Consult the cache before running
    pub read_cache: bool,
    /// Store the outcome after running
    pub write_cache: bool,
    pub auxiliary_files: Option<AuxiliaryFiles>,
    /// Leave the remote memo store out of this call, e.g. for results that
    /// only mean something on this machine
    pub skip_remote: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            read_cache: true,
            write_cache: true,
            auxiliary_files: None,
            skip_remote: false,
        }
    }
}

/// Session, queue, cache and host functions for one application
pub struct Runner {
    session: Arc<Session>,
    queue: TaskQueue,
    cache: ResultCache,
    remote: Option<Arc<dyn RemoteStore>>,
    registry: Arc<HostFunctionRegistry>,
}

impl Runner {
    /// Build a runner backed by a Python environment
    pub async fn start(config: &EngineConfig) -> Result<Self> {
        config.sandbox.validate()?;
        let launcher = PythonLauncher::new(
            config.runtime.clone(),
            config.sandbox.clone(),
            config.cache.dir.join("assets"),
        );
        let cache = ResultCache::open_or_disabled(&config.cache).await;
        let runner = Self::with_parts(Arc::new(Session::new(launcher)), cache);
        Ok(if config.remote.enabled {
            runner.with_remote(Arc::new(MemobinStore::new(config.remote.clone())))
        } else {
            runner
        })
    }

    pub fn with_parts(session: Arc<Session>, cache: ResultCache) -> Self {
        let registry = Arc::new(HostFunctionRegistry::new());
        let queue = TaskQueue::start(Arc::clone(&session), Arc::clone(&registry));
        Self {
            session,
            queue,
            cache,
            remote: None,
            registry,
        }
    }

    /// Put a remote memo store behind the local cache
    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Host functions scripts can reach through the bridge
    pub fn registry(&self) -> &HostFunctionRegistry {
        &self.registry
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Queue `code` with no caching
    pub fn run(
        &self,
        code: impl Into<String>,
        observer: Arc<dyn TaskObserver>,
        files: Option<AuxiliaryFiles>,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        self.queue.queue_task(code, observer, files)
    }

    /// Return the cached outcome for `code` or run it and cache the result
    pub async fn cached_run(
        &self,
        code: &str,
        options: &RunOptions,
        observer: Arc<dyn TaskObserver>,
    ) -> Result<CachedResult> {
        let key = self.cache.key_for(code, options.auxiliary_files.as_ref())?;

        let remote = self.remote.as_deref().filter(|_| !options.skip_remote);

        if options.read_cache {
            if let Some(hit) = self.cache.get(&key).await {
                return Ok(hit);
            }
            if let Some(remote) = remote {
                if let Some(hit) = load_remote(remote, &key).await {
                    if options.write_cache {
                        if let Err(e) = self.cache.set(&key, &hit).await {
                            warn!("Error setting cache: {}", e);
                        }
                    }
                    return Ok(hit);
                }
            }
        }

        let collector = Arc::new(ImageCollector::new(observer));
        let result = self
            .queue
            .queue_task(code, collector.clone(), options.auxiliary_files.clone())
            .await?;

        let outcome = CachedResult {
            result,
            images: collector.take(),
        };
        if options.write_cache {
            if let Err(e) = self.cache.set(&key, &outcome).await {
                warn!("Error setting cache: {}", e);
            }
            if let Some(remote) = remote.filter(|remote| remote.can_save()) {
                save_remote(remote, &key, &outcome).await;
            }
        }
        Ok(outcome)
    }
}

/// Remote lookup; any failure is a miss
async fn load_remote(remote: &dyn RemoteStore, key: &str) -> Option<CachedResult> {
    match remote.load(key).await {
        Ok(Some(text)) => match serde_json::from_str(&text) {
            Ok(hit) => {
                metrics::counter!(REMOTE_HITS).increment(1);
                Some(hit)
            }
            Err(e) => {
                warn!("Ignoring malformed remote memo for {}: {}", key, e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("Error loading remote memo: {}", e);
            None
        }
    }
}

async fn save_remote(remote: &dyn RemoteStore, key: &str, outcome: &CachedResult) {
    let text = match serde_json::to_string(outcome) {
        Ok(text) => text,
        Err(e) => {
            warn!("Error serializing memo: {}", e);
            return;
        }
    };
    match remote.save(key, &text).await {
        Ok(()) => metrics::counter!(REMOTE_UPLOADS).increment(1),
        Err(e) => warn!("Error saving remote memo: {}", e),
    }
}

/// Passes callbacks through and keeps the images
struct ImageCollector {
    inner: Arc<dyn TaskObserver>,
    images: Mutex<Vec<Value>>,
}

impl ImageCollector {
    fn new(inner: Arc<dyn TaskObserver>) -> Self {
        Self {
            inner,
            images: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.images.lock())
    }
}

impl TaskObserver for ImageCollector {
    fn on_stdout(&self, data: &str) {
        self.inner.on_stdout(data);
    }

    fn on_stderr(&self, data: &str) {
        self.inner.on_stderr(data);
    }

    fn on_status(&self, status: InterpreterStatus) {
        self.inner.on_status(status);
    }

    fn on_image(&self, image: &Value) {
        self.images.lock().push(image.clone());
        self.inner.on_image(image);
    }
}

/// The result slot of a [`ResultState`]
#[derive(Debug, Clone, PartialEq)]
pub enum ResultValue {
    /// Running, or failed without a value
    Pending,
    /// No code was given
    Skipped,
    Ready(Value),
}

/// What a [`ResultHook`] currently shows
#[derive(Debug, Clone, PartialEq)]
pub struct ResultState {
    pub result: ResultValue,
    pub images: Option<Vec<Value>>,
    pub status: Option<InterpreterStatus>,
}

impl ResultState {
    fn pending() -> Self {
        Self {
            result: ResultValue::Pending,
            images: None,
            status: None,
        }
    }

    /// Nothing more will change until the inputs do
    pub fn is_settled(&self) -> bool {
        !matches!(self.result, ResultValue::Pending) || self.status == Some(InterpreterStatus::Failed)
    }
}

struct HookShared {
    state: watch::Sender<ResultState>,
    // Canceled flag of the newest run; also serializes commits
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl HookShared {
    /// Apply `change` unless the run has been superseded
    fn commit(&self, canceled: &AtomicBool, change: impl FnOnce(&mut ResultState)) -> bool {
        let _guard = self.current.lock();
        if canceled.load(Ordering::SeqCst) {
            return false;
        }
        self.state.send_modify(change);
        true
    }
}

#[derive(Clone, PartialEq)]
struct HookInputs {
    code: Option<String>,
    options: RunOptions,
}

/// Reactive cached execution
///
/// Each change of code or options starts a new computation. The previous
/// one is marked canceled: its task still runs, and still writes the cache,
/// but it no longer touches this hook's state.
pub struct ResultHook {
    runner: Arc<Runner>,
    shared: Arc<HookShared>,
    last_inputs: Mutex<Option<HookInputs>>,
}

impl ResultHook {
    pub fn new(runner: Arc<Runner>) -> Self {
        let (state, _) = watch::channel(ResultState::pending());
        Self {
            runner,
            shared: Arc::new(HookShared {
                state,
                current: Mutex::new(None),
            }),
            last_inputs: Mutex::new(None),
        }
    }

    /// Set the inputs. Returns false when they did not change.
    pub fn update(&self, code: Option<&str>, options: RunOptions) -> bool {
        let inputs = HookInputs {
            code: code.map(str::to_string),
            options,
        };
        {
            let mut last = self.last_inputs.lock();
            if last.as_ref() == Some(&inputs) {
                return false;
            }
            *last = Some(inputs.clone());
        }

        let canceled = Arc::new(AtomicBool::new(false));
        {
            let mut current = self.shared.current.lock();
            if let Some(previous) = current.replace(Arc::clone(&canceled)) {
                previous.store(true, Ordering::SeqCst);
            }
            match &inputs.code {
                None => self.shared.state.send_modify(|state| state.result = ResultValue::Skipped),
                Some(_) => self.shared.state.send_modify(|state| *state = ResultState::pending()),
            }
        }

        if let Some(code) = inputs.code {
            let runner = Arc::clone(&self.runner);
            let shared = Arc::clone(&self.shared);
            tokio::spawn(compute(runner, shared, canceled, code, inputs.options));
        }
        true
    }

    pub fn state(&self) -> ResultState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResultState> {
        self.shared.state.subscribe()
    }

    /// Wait until the current computation settles
    pub async fn settled(&self) -> ResultState {
        let mut updates = self.subscribe();
        loop {
            let state = updates.borrow_and_update().clone();
            if state.is_settled() {
                return state;
            }
            if updates.changed().await.is_err() {
                return state;
            }
        }
    }
}

struct HookObserver {
    shared: Arc<HookShared>,
    canceled: Arc<AtomicBool>,
}

impl TaskObserver for HookObserver {
    fn on_stdout(&self, data: &str) {
        debug!(target: "sandbox_engine::script", "{}", data);
    }

    fn on_stderr(&self, data: &str) {
        warn!(target: "sandbox_engine::script", "{}", data);
    }

    fn on_status(&self, status: InterpreterStatus) {
        self.shared
            .commit(&self.canceled, |state| state.status = Some(status));
    }
}

async fn compute(
    runner: Arc<Runner>,
    shared: Arc<HookShared>,
    canceled: Arc<AtomicBool>,
    code: String,
    options: RunOptions,
) {
    let observer = Arc::new(HookObserver {
        shared: Arc::clone(&shared),
        canceled: Arc::clone(&canceled),
    });

    match runner.cached_run(&code, &options, observer).await {
        Ok(CachedResult { result, images }) => {
            shared.commit(&canceled, |state| {
                state.result = ResultValue::Ready(result);
                state.images = Some(images);
            });
        }
        Err(e) => debug!("Hook computation failed: {}", e),
    }
}
