use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use shellwright_core::*;
use shellwright_exec::copy::{RemoteFs, RemoteKind};
use shellwright_exec::error::ExecError;
use shellwright_exec::result::ExecutionResult;
use shellwright_exec::spec::{
    CommandSpec, ConnectionSpec, CopySource, CopySpec, LogMode, PREVIOUS_STDOUT_VAR, Target,
};
use shellwright_exec::traits::CommandRunner;
use shellwright_exec::{HostSpec, LocalRunner};

// Mock implementations
#[derive(Default)]
struct MockRunner {
    calls: Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        previous: Option<&ExecutionResult>,
        _mode: LogMode,
        _cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        self.calls.lock().unwrap().push((
            spec.command.clone(),
            previous.map(|p| p.stdout.clone()),
        ));
        if spec.command == "fail" {
            return Err(ExecError::CommandFailed {
                command: spec.command.clone(),
                reason: "exit status 1".to_string(),
                output: "boom".to_string(),
            });
        }
        Ok(ExecutionResult::new(format!("ran {}\n", spec.command), String::new()))
    }

    fn runner_type(&self) -> &'static str {
        "mock"
    }
}

impl MockRunner {
    fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }
}

#[derive(Default)]
struct MemoryFs {
    nodes: Mutex<BTreeMap<String, Option<Vec<u8>>>>,
    writes: AtomicUsize,
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn stat(&self, path: &str) -> Result<Option<RemoteKind>, ExecError> {
        Ok(self.nodes.lock().unwrap().get(path).map(|n| match n {
            None => RemoteKind::Directory,
            Some(_) => RemoteKind::File,
        }))
    }

    async fn create_dir(&self, path: &str) -> Result<(), ExecError> {
        self.nodes.lock().unwrap().insert(path.to_string(), None);
        Ok(())
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, ExecError> {
        let mut body = Vec::new();
        contents
            .read_to_end(&mut body)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        let len = body.len() as u64;
        self.nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), Some(body));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(len)
    }
}

struct SharedFs(Arc<MemoryFs>);

#[async_trait]
impl RemoteSession for SharedFs {
    fn fs(&self) -> &dyn RemoteFs {
        self.0.as_ref()
    }

    async fn close(self: Box<Self>) {}
}

struct MockTransport {
    runner: Arc<MockRunner>,
    fs: Arc<MemoryFs>,
    dials: AtomicUsize,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            runner: Arc::new(MockRunner::default()),
            fs: Arc::new(MemoryFs::default()),
            dials: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn runner(&self, _target: &Target) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    async fn open_fs(
        &self,
        _connection: &ConnectionSpec,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn RemoteSession>, ExecError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SharedFs(self.fs.clone())))
    }
}

fn engine() -> (Engine, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let engine = Engine::with_transport(EngineConfig::default(), transport.clone());
    (engine, transport)
}

fn text_copy(text: &str, remote: &str) -> CopySpec {
    CopySpec::new(
        ConnectionSpec::new("10.0.0.5"),
        CopySource::Text(text.to_string()),
        remote,
    )
}

#[tokio::test]
async fn test_command_lifecycle() {
    let runner = MockRunner::default();
    let cancel = CancellationToken::new();
    let mut resource = CommandResource::new("svc", "install");
    resource.delete = Some("uninstall".to_string());

    let created = resource
        .create(&runner, LogMode::None, false, &cancel)
        .await
        .unwrap();
    assert_eq!(created.stdout, "ran install");

    // no update command: create runs again with the previous output
    let updated = resource
        .update(&runner, &created, LogMode::None, false, &cancel)
        .await
        .unwrap();
    assert_eq!(updated.id, created.id);

    resource.update = Some("upgrade".to_string());
    let upgraded = resource
        .update(&runner, &updated, LogMode::None, false, &cancel)
        .await
        .unwrap();
    assert_eq!(upgraded.stdout, "ran upgrade");

    resource
        .delete(&runner, &upgraded, LogMode::None, &cancel)
        .await
        .unwrap();

    let calls = runner.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            ("install".to_string(), None),
            ("install".to_string(), Some("ran install".to_string())),
            ("upgrade".to_string(), Some("ran install".to_string())),
            ("uninstall".to_string(), Some("ran upgrade".to_string())),
        ]
    );
}

#[tokio::test]
async fn test_preview_runs_nothing() {
    let runner = MockRunner::default();
    let cancel = CancellationToken::new();
    let resource = CommandResource::new("svc", "install");

    let created = resource
        .create(&runner, LogMode::None, true, &cancel)
        .await
        .unwrap();
    assert!(!created.resolved);

    let previous = ExecutionResult::new("old".to_string(), String::new());
    let updated = resource
        .update(&runner, &previous, LogMode::None, true, &cancel)
        .await
        .unwrap();
    assert!(!updated.resolved);
    assert_eq!(updated.id, previous.id);
    assert!(runner.commands().is_empty());
}

#[tokio::test]
async fn test_missing_steps_are_noops() {
    let runner = MockRunner::default();
    let cancel = CancellationToken::new();
    let mut resource = CommandResource::new("svc", "x");
    resource.create = None;

    let created = resource
        .create(&runner, LogMode::None, false, &cancel)
        .await
        .unwrap();
    assert!(created.resolved && created.stdout.is_empty());
    resource
        .delete(&runner, &created, LogMode::None, &cancel)
        .await
        .unwrap();
    assert!(runner.commands().is_empty());
}

#[tokio::test]
async fn test_failed_step_surfaces_output() {
    let runner = MockRunner::default();
    let resource = CommandResource::new("svc", "fail");
    let err = resource
        .create(&runner, LogMode::None, false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Exec(ExecError::CommandFailed { .. })));
    assert!(err.to_string().ends_with("boom"));
}

#[tokio::test]
async fn test_engine_preview_has_no_side_effects() {
    let (engine, transport) = engine();
    let cancel = CancellationToken::new();

    let result = engine
        .run_local(&CommandSpec::new("echo hi"), None, None, true, &cancel)
        .await
        .unwrap();
    assert!(!result.resolved);

    let result = engine
        .run_remote(
            &ConnectionSpec::new("10.0.0.5"),
            &CommandSpec::new("echo hi"),
            None,
            None,
            true,
            &cancel,
        )
        .await
        .unwrap();
    assert!(!result.resolved);

    let state = engine
        .copy_to_remote(&text_copy("hello", "/etc/motd"), true, &cancel)
        .await
        .unwrap();
    assert!(!state.resolved);

    assert!(transport.runner.commands().is_empty());
    assert_eq!(transport.dials.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_input_rejected_before_io() {
    let (engine, transport) = engine();
    let cancel = CancellationToken::new();

    let err = engine
        .run_remote(
            &ConnectionSpec::new(""),
            &CommandSpec::new("echo hi"),
            None,
            None,
            false,
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Exec(ExecError::InvalidInput(_))));

    let err = engine
        .copy_to_remote(&text_copy("hello", ""), false, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Exec(ExecError::InvalidInput(_))));
    assert_eq!(transport.dials.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_copy_update_is_idempotent() {
    let (engine, transport) = engine();
    let cancel = CancellationToken::new();
    let spec = text_copy("hello", "/etc/motd");

    let state = engine.copy_to_remote(&spec, false, &cancel).await.unwrap();
    assert!(state.resolved);
    assert_eq!(transport.fs.writes.load(Ordering::SeqCst), 1);

    let (same, changed) = engine
        .update_copy(&state, &spec, false, &cancel)
        .await
        .unwrap();
    assert!(!changed);
    assert_eq!(same, state);
    assert_eq!(transport.dials.load(Ordering::SeqCst), 1);
    assert_eq!(transport.fs.writes.load(Ordering::SeqCst), 1);

    let moved = text_copy("hello", "/etc/motd.d/banner");
    let (new_state, changed) = engine
        .update_copy(&state, &moved, false, &cancel)
        .await
        .unwrap();
    assert!(changed);
    assert_eq!(new_state.id, state.id);
    assert_eq!(transport.fs.writes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_copy_directory_through_engine() {
    let (engine, transport) = engine();
    let local = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(local.path().join("site/css")).unwrap();
    std::fs::write(local.path().join("site/index.html"), "<html>").unwrap();
    std::fs::write(local.path().join("site/css/app.css"), "body{}").unwrap();
    transport.fs.create_dir("/srv").await.unwrap();

    let source = CopySource::directory(local.path().join("site").to_string_lossy());
    let spec = CopySpec::new(ConnectionSpec::new("10.0.0.5"), source, "/srv");
    engine
        .copy_to_remote(&spec, false, &CancellationToken::new())
        .await
        .unwrap();

    let nodes = transport.fs.nodes.lock().unwrap();
    assert_eq!(nodes.get("/srv/site"), Some(&None));
    assert_eq!(
        nodes.get("/srv/site/css/app.css"),
        Some(&Some(b"body{}".to_vec()))
    );
    assert!(nodes.contains_key("/srv/site/index.html"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_previous_output_round_trip() {
    let runner = LocalRunner::new();
    let cancel = CancellationToken::new();
    let mut resource = CommandResource::new("echo", "echo X");
    resource.update = Some(format!("echo ${PREVIOUS_STDOUT_VAR}"));

    let created = resource
        .create(&runner, LogMode::None, false, &cancel)
        .await
        .unwrap();
    assert_eq!(created.stdout, "X");

    let updated = resource
        .update(&runner, &created, LogMode::None, false, &cancel)
        .await
        .unwrap();
    assert_eq!(updated.stdout, "X");
}

#[cfg(unix)]
#[tokio::test]
async fn test_default_engine_runs_locally() {
    let engine = Engine::new(EngineConfig::default());
    let result = engine
        .run_local(
            &CommandSpec::new("echo hi"),
            None,
            Some(LogMode::None),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout, "hi");
    assert_eq!(result.stderr, "");
    assert!(result.resolved);
}

#[test]
fn test_remote_target_from_resource() {
    let mut resource = CommandResource::new("r", "true");
    resource.connection = Some(ConnectionSpec::from(HostSpec::new("10.0.0.9")));
    assert!(matches!(resource.target(), Target::Remote(_)));
}
