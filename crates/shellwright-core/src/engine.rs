//! Lifecycle-facing entry points
//!
//! Every operation takes a `preview` flag. A preview validates its input and
//! returns placeholder output without spawning, dialing or writing anything.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shellwright_exec::copy::{self, CopyRecord};
use shellwright_exec::result::new_id;
use shellwright_exec::{
    CommandRunner, CommandSpec, ConnectionSpec, CopySpec, ExecError, ExecutionResult, LogMode,
    Target,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::transport::{DefaultTransport, Transport};

/// State of a copy after it was applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyState {
    /// Unique identity of the copy
    pub id: String,
    #[serde(flatten)]
    pub record: CopyRecord,
    /// False for preview placeholders
    pub resolved: bool,
}

/// Applies command runs and copies
pub struct Engine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine backed by local processes, SSH and SFTP
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let transport = Arc::new(DefaultTransport::new(&config));
        Self { config, transport }
    }

    /// Engine backed by a custom transport
    #[must_use]
    pub fn with_transport(config: EngineConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runner for `target`
    #[must_use]
    pub fn runner(&self, target: &Target) -> Arc<dyn CommandRunner> {
        self.transport.runner(target)
    }

    /// Run `spec` on this machine
    ///
    /// # Errors
    /// Returns `CoreError::Exec` if the command fails or is cancelled
    #[instrument(skip_all, fields(command = %spec.command, preview = preview))]
    pub async fn run_local(
        &self,
        spec: &CommandSpec,
        previous: Option<&ExecutionResult>,
        logging: Option<LogMode>,
        preview: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, CoreError> {
        if preview {
            return Ok(ExecutionResult::placeholder());
        }
        let runner = self.runner(&Target::Local);
        Ok(runner
            .run(spec, previous, self.config.logging(logging), cancel)
            .await?)
    }

    /// Run `spec` on the host described by `connection`
    ///
    /// # Errors
    /// Returns `CoreError::Exec` for invalid connections, dial failures and
    /// failed commands
    #[instrument(skip_all, fields(host = %connection.target.host, preview = preview))]
    pub async fn run_remote(
        &self,
        connection: &ConnectionSpec,
        spec: &CommandSpec,
        previous: Option<&ExecutionResult>,
        logging: Option<LogMode>,
        preview: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, CoreError> {
        connection.validate()?;
        if preview {
            return Ok(ExecutionResult::placeholder());
        }
        let runner = self.runner(&Target::Remote(connection.clone()));
        Ok(runner
            .run(spec, previous, self.config.logging(logging), cancel)
            .await?)
    }

    /// Copy the source of `spec` to its remote path
    ///
    /// # Errors
    /// Returns `CoreError::Exec` for invalid specs, dial failures and remote
    /// path conflicts
    #[instrument(skip_all, fields(host = %spec.connection.target.host, remote = %spec.remote_path, preview = preview))]
    pub async fn copy_to_remote(
        &self,
        spec: &CopySpec,
        preview: bool,
        cancel: &CancellationToken,
    ) -> Result<CopyState, CoreError> {
        spec.validate()?;
        if preview {
            return Ok(placeholder_copy(new_id(), spec));
        }

        let record = CopyRecord {
            content_hash: content_hash(spec).await?,
            remote_path: spec.remote_path.clone(),
        };
        self.copy(spec, cancel).await?;
        Ok(CopyState {
            id: new_id(),
            record,
            resolved: true,
        })
    }

    /// Re-apply a copy, skipping it when nothing changed
    ///
    /// Returns the new state and whether a copy happened. An unchanged copy
    /// never dials the remote host.
    ///
    /// # Errors
    /// Returns `CoreError::Exec` when a needed copy fails
    #[instrument(skip_all, fields(id = %old.id, preview = preview))]
    pub async fn update_copy(
        &self,
        old: &CopyState,
        spec: &CopySpec,
        preview: bool,
        cancel: &CancellationToken,
    ) -> Result<(CopyState, bool), CoreError> {
        spec.validate()?;
        if preview {
            return Ok((placeholder_copy(old.id.clone(), spec), false));
        }

        let record = CopyRecord {
            content_hash: content_hash(spec).await?,
            remote_path: spec.remote_path.clone(),
        };
        let changed = copy::needs_copy(&old.record, &record.content_hash, &record.remote_path);
        if changed {
            self.copy(spec, cancel).await?;
        } else {
            debug!("copy source and destination unchanged");
        }
        Ok((
            CopyState {
                id: old.id.clone(),
                record,
                resolved: true,
            },
            changed,
        ))
    }

    async fn copy(&self, spec: &CopySpec, cancel: &CancellationToken) -> Result<(), CoreError> {
        let session = self.transport.open_fs(&spec.connection, cancel).await?;
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ExecError::Cancelled),
            result = copy::copy(session.fs(), &spec.source, &spec.remote_path) => result,
        };
        session.close().await;
        result?;
        info!(remote = %spec.remote_path, "copied to remote host");
        Ok(())
    }
}

/// Hash the copy source on the blocking pool; a large tree is read in full
async fn content_hash(spec: &CopySpec) -> Result<String, CoreError> {
    let spec = spec.clone();
    let hash = tokio::task::spawn_blocking(move || spec.content_hash())
        .await
        .map_err(|e| ExecError::IoError(format!("hashing copy source: {e}")))??;
    Ok(hash)
}

fn placeholder_copy(id: String, spec: &CopySpec) -> CopyState {
    CopyState {
        id,
        record: CopyRecord {
            content_hash: String::new(),
            remote_path: spec.remote_path.clone(),
        },
        resolved: false,
    }
}
