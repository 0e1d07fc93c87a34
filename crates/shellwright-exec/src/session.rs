//! Remote command execution over an SSH session channel

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use russh::{Channel, ChannelMsg, client};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, instrument, warn};

use crate::error::ExecError;
use crate::output::{LogSink, Multiplexer, TracingSink};
use crate::result::{ExecutionResult, trim_trailing_newline};
use crate::spec::{CommandSpec, ConnectionSpec, LogMode};
use crate::ssh::{Connection, Dialer};
use crate::traits::CommandRunner;

/// SSH command runner
///
/// Dials a fresh connection per run and executes the command text on one
/// session channel. The channel delivers stdout and stderr as interleaved
/// messages, so a single pump feeds both fan-outs while a writer task feeds
/// stdin.
pub struct SshRunner {
    connection: ConnectionSpec,
    dialer: Dialer,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for SshRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshRunner")
            .field("host", &self.connection.target.endpoint())
            .field("proxied", &self.connection.proxy.is_some())
            .finish_non_exhaustive()
    }
}

impl SshRunner {
    /// Create a runner for `connection` that logs through `tracing`
    #[must_use]
    pub fn new(connection: ConnectionSpec) -> Self {
        let sink: Arc<dyn LogSink> = Arc::new(TracingSink);
        Self {
            connection,
            dialer: Dialer::new(sink.clone()),
            sink,
        }
    }

    /// Use `dialer` for connections and `sink` for mirrored output
    #[must_use]
    pub fn with_dialer(mut self, dialer: Dialer, sink: Arc<dyn LogSink>) -> Self {
        self.dialer = dialer;
        self.sink = sink;
        self
    }

    /// Connection this runner dials
    #[must_use]
    pub fn connection(&self) -> &ConnectionSpec {
        &self.connection
    }

    fn check_supported(spec: &CommandSpec) -> Result<(), ExecError> {
        if spec.wants_harvest() {
            return Err(ExecError::InvalidInput(
                "asset and archive paths are only supported for local commands".to_string(),
            ));
        }
        if !spec.interpreter.is_empty() || spec.dir.is_some() {
            return Err(ExecError::InvalidInput(
                "interpreter and dir are only supported for local commands".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        conn: &Connection,
        spec: &CommandSpec,
        previous: Option<&ExecutionResult>,
        mode: LogMode,
    ) -> Result<ExecutionResult, ExecError> {
        let start = Instant::now();
        let mut channel = conn.open_session().await?;

        for (name, value) in &spec.environment {
            if let Err(e) = set_env(&mut channel, name, value).await {
                error!(
                    variable = %name,
                    error = %e,
                    "could not set environment variable; the server must list it in AcceptEnv, \
                     or set it inline as `{name}=value command`"
                );
                return Err(e);
            }
        }
        for (name, value) in spec.previous_output_env(previous) {
            if let Err(e) = set_env(&mut channel, name, &value).await {
                warn!(variable = name, error = %e, "previous output not exported to remote command");
            }
        }

        debug!(endpoint = %conn.endpoint(), "executing remote command");
        channel
            .exec(true, spec.command.as_bytes())
            .await
            .map_err(|e| ExecError::SessionError(e.to_string()))?;

        // stdin is written while the pump below reads output, otherwise a
        // command echoing a large input stalls on the channel window
        let _stdin_writer = match spec.stdin_bytes() {
            Some(bytes) => {
                let bytes = bytes.to_vec();
                let mut writer = channel.make_writer();
                Some(AbortOnDropHandle::new(tokio::spawn(async move {
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!(error = %e, "remote stdin write stopped early");
                    }
                    // shutting the writer down sends EOF
                    if let Err(e) = writer.shutdown().await {
                        debug!(error = %e, "remote stdin EOF not sent");
                    }
                })))
            }
            None => {
                channel
                    .eof()
                    .await
                    .map_err(|e| ExecError::SessionError(e.to_string()))?;
                None
            }
        };

        let (mux, mut stdout, mut stderr) = Multiplexer::new(mode, self.sink.clone());
        let mut exit_status = None;
        let mut exit_signal = None;

        // drain until the server closes the channel; the exit status may
        // arrive after EOF
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.write(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.write(&data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::ExitSignal {
                    signal_name,
                    error_message,
                    ..
                } => exit_signal = Some(format!("signal {signal_name:?} {error_message}")),
                _ => {}
            }
        }

        let stdout = stdout.finish();
        let stderr = stderr.finish();
        let combined = mux.finish().await;

        debug!(status = ?exit_status, duration = ?start.elapsed(), "remote command completed");

        let reason = match (exit_status, exit_signal) {
            (Some(0), _) => None,
            (Some(code), _) => Some(format!("exit status {code}")),
            (None, Some(signal)) => Some(format!("terminated by {}", signal.trim_end())),
            (None, None) => Some("session closed without an exit status".to_string()),
        };
        if let Some(reason) = reason {
            error!(reason = %reason, "remote command failed");
            let output = String::from_utf8_lossy(&combined);
            return Err(ExecError::CommandFailed {
                command: spec.command.clone(),
                reason,
                output: trim_trailing_newline(&output).to_string(),
            });
        }

        Ok(ExecutionResult::from_output(&stdout, &stderr))
    }
}

/// Request `name=value` on the channel and wait for the server's answer
async fn set_env(
    channel: &mut Channel<client::Msg>,
    name: &str,
    value: &str,
) -> Result<(), ExecError> {
    let set_env_err = |reason: String| ExecError::SetEnv {
        name: name.to_string(),
        reason,
    };
    channel
        .set_env(true, name, value)
        .await
        .map_err(|e| set_env_err(e.to_string()))?;
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => return Err(set_env_err("refused by server".to_string())),
            Some(_) => {}
            None => return Err(set_env_err("channel closed".to_string())),
        }
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    #[instrument(skip_all, fields(host = %self.connection.target.host, command = %spec.command))]
    async fn run(
        &self,
        spec: &CommandSpec,
        previous: Option<&ExecutionResult>,
        mode: LogMode,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        Self::check_supported(spec)?;
        let conn = self.dialer.dial(&self.connection, cancel).await?;

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ExecError::Cancelled),
            result = self.execute(&conn, spec, previous, mode) => result,
        };
        conn.close().await;
        result
    }

    fn runner_type(&self) -> &'static str {
        "ssh"
    }
}
