//! Command runner trait

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::ExecError;
use crate::result::ExecutionResult;
use crate::spec::{CommandSpec, LogMode};

/// Runs a command spec somewhere and captures its output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion
    ///
    /// `previous` is the result of an earlier run of the same logical
    /// resource; its output is exported through the reserved variables unless
    /// `add_previous_output_in_env` is off.
    ///
    /// # Errors
    /// Returns `ExecError::CommandFailed` on a non-zero exit, and
    /// `ExecError::Cancelled` when `cancel` fires first
    async fn run(
        &self,
        spec: &CommandSpec,
        previous: Option<&ExecutionResult>,
        mode: LogMode,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError>;

    /// Run `spec`, cancelling it once `timeout` elapses
    ///
    /// # Errors
    /// Returns `ExecError::Timeout` if the run outlives `timeout`
    async fn run_with_timeout(
        &self,
        spec: &CommandSpec,
        previous: Option<&ExecutionResult>,
        mode: LogMode,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecError> {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        match tokio::time::timeout(timeout, self.run(spec, previous, mode, &cancel)).await {
            Ok(result) => result,
            Err(_) => {
                error!(command = %spec.command, timeout = ?timeout, "command timed out");
                Err(ExecError::Timeout { timeout })
            }
        }
    }

    /// Short name for logs
    fn runner_type(&self) -> &'static str;
}
