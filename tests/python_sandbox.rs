// tests/python_sandbox.rs
//! End-to-end runs against a real `python3`
//!
//! Each test starts its own interpreter under a temporary directory. When
//! no `python3` is on PATH the tests return early.

use parking_lot::Mutex;
use sandbox_engine::cache::CacheConfig;
use sandbox_engine::facade::{RunOptions, Runner};
use sandbox_engine::runtime::protocol::{AuxiliaryFile, AuxiliaryFiles, InterpreterStatus};
use sandbox_engine::runtime::queue::TaskObserver;
use sandbox_engine::runtime::sandbox::SandboxConfig;
use sandbox_engine::utils::config::EngineConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Default)]
struct Recorder {
    stdout: Mutex<Vec<String>>,
    stderr: Mutex<Vec<String>>,
    statuses: Mutex<Vec<InterpreterStatus>>,
}

impl TaskObserver for Recorder {
    fn on_stdout(&self, data: &str) {
        self.stdout.lock().push(data.to_string());
    }

    fn on_stderr(&self, data: &str) {
        self.stderr.lock().push(data.to_string());
    }

    fn on_status(&self, status: InterpreterStatus) {
        self.statuses.lock().push(status);
    }
}

fn python_available() -> bool {
    which::which("python3").is_ok()
}

async fn start_runner(dir: &TempDir) -> Runner {
    let mut config = EngineConfig::default();
    config.runtime.work_dir = dir.path().join("vfs");
    config.sandbox = SandboxConfig::unlimited();
    config.cache = CacheConfig {
        dir: dir.path().join("cache"),
        ..Default::default()
    };
    Runner::start(&config).await.unwrap()
}

#[tokio::test]
async fn test_expression_value_is_the_result() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let runner = start_runner(&dir).await;
    let recorder = Arc::new(Recorder::default());

    let value = runner.run("1 + 1", recorder.clone(), None).await.unwrap();

    assert_eq!(value, json!(2));
    assert_eq!(
        *recorder.statuses.lock(),
        vec![
            InterpreterStatus::Loading,
            InterpreterStatus::Installing,
            InterpreterStatus::Running,
            InterpreterStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn test_output_streams_then_failure_rejects() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let runner = start_runner(&dir).await;
    let recorder = Arc::new(Recorder::default());

    let code = "print('before')\nraise ValueError('boom')";
    let result = runner.run(code, recorder.clone(), None).await;

    assert!(result.is_err());
    assert_eq!(*recorder.stdout.lock(), vec!["before".to_string()]);
    let stderr = recorder.stderr.lock().join("\n");
    assert!(stderr.contains("ValueError: boom"));
    assert_eq!(recorder.statuses.lock().last(), Some(&InterpreterStatus::Failed));
}

#[tokio::test]
async fn test_environment_survives_across_tasks() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let runner = start_runner(&dir).await;
    let observer = Arc::new(Recorder::default());

    let first = runner.run("import sys\nsys.version_info[0]", observer.clone(), None);
    let second = runner.run("{'a': [1, 2.5, None]}", observer.clone(), None);

    assert_eq!(first.await.unwrap(), json!(3));
    assert_eq!(second.await.unwrap(), json!({"a": [1, 2.5, null]}));
    assert!(runner.session().is_initialized());
}

#[tokio::test]
async fn test_auxiliary_files_visible_then_removed() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let runner = start_runner(&dir).await;
    let observer = Arc::new(Recorder::default());

    let mut files = AuxiliaryFiles::new();
    files.insert("data/input.txt".into(), AuxiliaryFile::Text("hello".into()));
    files.insert("blob.bin".into(), AuxiliaryFile::from_bytes(&[0, 1, 2]));

    let code = "open('data/input.txt').read() + str(len(open('blob.bin', 'rb').read()))";
    let value = runner.run(code, observer.clone(), Some(files)).await.unwrap();
    assert_eq!(value, json!("hello3"));

    let check = "import os\n[os.path.exists('data/input.txt'), os.path.exists('blob.bin')]";
    let value = runner.run(check, observer, None).await.unwrap();
    assert_eq!(value, json!([false, false]));
}

#[tokio::test]
async fn test_script_awaits_host_function() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let runner = start_runner(&dir).await;
    runner.registry().register_fn("add", |args: Vec<Value>| async move {
        let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
        Ok(json!(sum))
    });

    let code = "import host_bridge\nawait host_bridge.acall_async_host('add', 2, 3) + host_bridge.call_async_host('add', 10)";
    let value = runner
        .run(code, Arc::new(Recorder::default()), None)
        .await
        .unwrap();
    assert_eq!(value, json!(15));

    let missing = "import host_bridge\nhost_bridge.call_async_host('nope')";
    let recorder = Arc::new(Recorder::default());
    assert!(runner.run(missing, recorder.clone(), None).await.is_err());
    assert!(recorder.stderr.lock().join("\n").contains("no host function registered"));
}

#[tokio::test]
async fn test_cached_run_skips_second_execution() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let runner = start_runner(&dir).await;
    let options = RunOptions::default();

    let first = runner
        .cached_run("sum(range(10))", &options, Arc::new(Recorder::default()))
        .await
        .unwrap();
    let second = runner
        .cached_run("sum(range(10))", &options, Arc::new(Recorder::default()))
        .await
        .unwrap();

    assert_eq!(first.result, json!(45));
    assert_eq!(second, first);
    assert_eq!(runner.queue().dispatched_count(), 1);
}

#[tokio::test]
async fn test_result_values_become_plain_json() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let runner = start_runner(&dir).await;
    let observer = Arc::new(Recorder::default());

    let cases = [
        ("(1, 2)", json!([1, 2])),
        ("{3}", json!([3])),
        ("class Arrayish:\n    def tolist(self):\n        return [1, 2]\nArrayish()", json!([1, 2])),
        ("float('nan')", Value::Null),
        ("[float('inf'), 1.5]", json!([null, 1.5])),
        ("x = 1", Value::Null),
        ("import asyncio\nawait asyncio.sleep(0)\nawait asyncio.sleep(0, result=5)", json!(5)),
    ];
    for (code, expected) in cases {
        let value = runner.run(code, observer.clone(), None).await.unwrap();
        assert_eq!(value, expected, "{}", code);
    }

    let value = runner.run("0.1 + 0.2", observer, None).await.unwrap();
    assert_eq!(value.as_f64(), Some(0.1 + 0.2));
}

#[tokio::test]
async fn test_oversized_image_does_not_shift_later_results() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let runner = start_runner(&dir).await;
    let recorder = Arc::new(Recorder::default());

    let code = "_SP_ADD_IMAGE('x' * (65 * 1024 * 1024))\n1";
    let value = runner.run(code, recorder.clone(), None).await.unwrap();
    assert_eq!(value, json!(1));
    assert!(recorder
        .stderr
        .lock()
        .iter()
        .any(|line| line.contains("exceeds the size limit")));

    let value = runner
        .run("7", Arc::new(Recorder::default()), None)
        .await
        .unwrap();
    assert_eq!(value, json!(7));
}
