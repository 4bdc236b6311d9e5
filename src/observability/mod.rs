// src/observability/mod.rs
//! Tracing and metrics setup
//!
//! Logs go to stderr through `tracing-subscriber`; the level is taken from
//! `RUST_LOG` and defaults to `info`. Metrics are recorded with the `metrics`
//! facade and rendered by the Prometheus exporter on demand.

use crate::utils::errors::{EngineError, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

pub const TASKS_ENQUEUED: &str = "sandbox_tasks_enqueued_total";
pub const TASKS_COMPLETED: &str = "sandbox_tasks_completed_total";
pub const TASKS_FAILED: &str = "sandbox_tasks_failed_total";
pub const QUEUE_DEPTH: &str = "sandbox_queue_depth";
pub const TASK_DURATION: &str = "sandbox_task_duration_seconds";
pub const ENVIRONMENT_INITS: &str = "sandbox_environment_inits_total";
pub const BRIDGE_CALLS: &str = "sandbox_bridge_calls_total";
pub const CACHE_HITS: &str = "sandbox_cache_hits_total";
pub const CACHE_MISSES: &str = "sandbox_cache_misses_total";
pub const CACHE_PURGES: &str = "sandbox_cache_purges_total";
pub const REMOTE_HITS: &str = "sandbox_remote_cache_hits_total";
pub const REMOTE_UPLOADS: &str = "sandbox_remote_cache_uploads_total";

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the global tracing subscriber. Later calls are no-ops.
pub fn init_tracing(json: bool) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_target(false);

        let installed = if json {
            builder.json().try_init()
        } else {
            builder.with_ansi(false).try_init()
        };
        installed.map_err(|e| EngineError::Config(format!("tracing init failed: {}", e)))
    })?;
    Ok(())
}

/// Install the Prometheus recorder and describe engine metrics
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = METRICS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| EngineError::Config(format!("metrics init failed: {}", e)))?;
        describe_metrics();
        Ok::<_, EngineError>(handle)
    })?;
    Ok(handle.clone())
}

fn describe_metrics() {
    describe_counter!(TASKS_ENQUEUED, "Tasks accepted by the task queue");
    describe_counter!(TASKS_COMPLETED, "Tasks whose script completed");
    describe_counter!(TASKS_FAILED, "Tasks whose script failed");
    describe_gauge!(QUEUE_DEPTH, "Tasks waiting or running");
    describe_histogram!(TASK_DURATION, Unit::Seconds, "Dispatch-to-settle time per task");
    describe_counter!(ENVIRONMENT_INITS, "Cold starts of the execution environment");
    describe_counter!(BRIDGE_CALLS, "Host functions invoked from the sandbox");
    describe_counter!(CACHE_HITS, "Result cache hits");
    describe_counter!(CACHE_MISSES, "Result cache misses");
    describe_counter!(CACHE_PURGES, "Full clears of the result cache");
    describe_counter!(REMOTE_HITS, "Results served by the remote memo store");
    describe_counter!(REMOTE_UPLOADS, "Results uploaded to the remote memo store");
}
