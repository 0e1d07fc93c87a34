//! Local command execution using `tokio::process`

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::error::ExecError;
use crate::glob;
use crate::output::{LogSink, Multiplexer, TracingSink};
use crate::result::{ExecutionResult, trim_trailing_newline};
use crate::spec::{CommandSpec, LogMode};
use crate::traits::CommandRunner;

/// Local command runner
///
/// Spawns the interpreter as a child process on this machine. stdout and
/// stderr are drained by two tasks while the main task waits for exit.
#[derive(Clone)]
pub struct LocalRunner {
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for LocalRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRunner").finish_non_exhaustive()
    }
}

impl LocalRunner {
    /// Create a runner that mirrors output through `tracing`
    #[must_use]
    pub fn new() -> Self {
        Self::with_sink(Arc::new(TracingSink))
    }

    /// Create a runner that mirrors output to `sink`
    #[must_use]
    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    fn working_dir(spec: &CommandSpec) -> Result<PathBuf, ExecError> {
        match &spec.dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().map_err(|e| ExecError::IoError(e.to_string())),
        }
    }

    #[instrument(skip_all, fields(command = %spec.command), level = "debug")]
    async fn execute(
        &self,
        spec: &CommandSpec,
        previous: Option<&ExecutionResult>,
        mode: LogMode,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        let start = Instant::now();
        let argv = spec.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecError::InvalidInput("interpreter is empty".to_string()));
        };
        let dir = Self::working_dir(spec)?;
        let stdin = spec.stdin_bytes();

        debug!(program = %program, dir = %dir.display(), "spawning local command");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&dir)
            .envs(&spec.environment)
            .envs(spec.previous_output_env(previous))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::SpawnError(format!("{program}: {e}")))?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let bytes = bytes.to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&bytes).await {
                    // the child may exit without reading its input
                    debug!(error = %e, "stdin write stopped early");
                }
            });
        }

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => return Err(ExecError::IoError("child pipes unavailable".to_string())),
        };

        let (mux, out_fan, err_fan) = Multiplexer::new(mode, self.sink.clone());
        let out_task = tokio::spawn(out_fan.drain(stdout));
        let err_task = tokio::spawn(err_fan.drain(stderr));

        let status = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                warn!("cancelled, killing child process");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill child process");
                }
                out_task.abort();
                err_task.abort();
                let _ = mux.finish().await;
                return Err(ExecError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| ExecError::IoError(e.to_string()))?,
        };

        // a background grandchild can hold the pipes open past the exit
        let out_abort = out_task.abort_handle();
        let err_abort = err_task.abort_handle();
        let drained = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            drained = async {
                Ok::<_, ExecError>((join_drain(out_task).await?, join_drain(err_task).await?))
            } => Some(drained?),
        };
        let Some((stdout, stderr)) = drained.filter(|_| !cancel.is_cancelled()) else {
            warn!("cancelled while output pipes were still open");
            out_abort.abort();
            err_abort.abort();
            let _ = mux.finish().await;
            return Err(ExecError::Cancelled);
        };
        let combined = mux.finish().await;

        debug!(status = %status, duration = ?start.elapsed(), "command completed");

        if !status.success() {
            let output = String::from_utf8_lossy(&combined);
            error!(status = %status, "command failed");
            return Err(ExecError::CommandFailed {
                command: spec.command.clone(),
                reason: describe_status(status),
                output: trim_trailing_newline(&output).to_string(),
            });
        }

        let mut result = ExecutionResult::from_output(&stdout, &stderr);
        if spec.wants_harvest() {
            result.assets = harvest(&dir, spec.asset_paths.as_deref()).await?;
            result.archive = harvest(&dir, spec.archive_paths.as_deref()).await?;
        }
        Ok(result)
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        previous: Option<&ExecutionResult>,
        mode: LogMode,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        self.execute(spec, previous, mode, cancel).await
    }

    fn runner_type(&self) -> &'static str {
        "local"
    }
}

async fn join_drain(
    task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>, ExecError> {
    task.await
        .map_err(|e| ExecError::IoError(e.to_string()))?
        .map_err(|e| ExecError::IoError(e.to_string()))
}

async fn harvest(
    dir: &Path,
    patterns: Option<&[String]>,
) -> Result<Option<std::collections::BTreeMap<String, PathBuf>>, ExecError> {
    let Some(patterns) = patterns else {
        return Ok(None);
    };
    let dir = dir.to_path_buf();
    let patterns = patterns.to_vec();
    tokio::task::spawn_blocking(move || glob::harvest(&dir, &patterns))
        .await
        .map_err(|e| ExecError::IoError(e.to_string()))?
        .map(Some)
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => format!("terminated abnormally ({status})"),
    }
}
