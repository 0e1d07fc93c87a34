//! Command resources: create, update and delete commands with tracked output

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shellwright_exec::{
    CommandRunner, CommandSpec, ConnectionSpec, ExecutionResult, LogMode, Target,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::CoreError;

/// A command resource as declared in a manifest
///
/// The shared [`CommandSpec`] options apply to every step; the step's own
/// command text replaces `command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResource {
    /// Resource name, used in logs and errors
    pub name: String,
    /// Run remotely when set, locally otherwise
    #[serde(default)]
    pub connection: Option<ConnectionSpec>,
    /// Command run when the resource is created
    #[serde(default)]
    pub create: Option<String>,
    /// Command run on update; falls back to `create`
    #[serde(default)]
    pub update: Option<String>,
    /// Command run when the resource is deleted
    #[serde(default)]
    pub delete: Option<String>,
    /// Which streams are mirrored to the log
    #[serde(default)]
    pub logging: Option<LogMode>,
    /// Any change to these values replaces the resource: delete, then create
    #[serde(default)]
    pub triggers: Vec<serde_json::Value>,
    #[serde(flatten)]
    pub options: CommandSpec,
}

/// Applied state of a command resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandState {
    #[serde(flatten)]
    pub result: ExecutionResult,
    /// Hash of the inputs `result` was produced from
    #[serde(default)]
    pub inputs_hash: String,
    /// Hash of the triggers when the resource was created
    #[serde(default)]
    pub triggers_hash: String,
}

/// What an apply has to do to bring a command resource up to date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandChange {
    /// Never applied
    Create,
    /// Inputs changed; run the update step
    Update,
    /// Triggers changed; delete, then create
    Replace,
    Unchanged,
}

impl CommandResource {
    /// Local resource with only a create command
    pub fn new(name: impl Into<String>, create: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: None,
            create: Some(create.into()),
            update: None,
            delete: None,
            logging: None,
            triggers: Vec::new(),
            options: CommandSpec::default(),
        }
    }

    /// Where the resource's commands run
    #[must_use]
    pub fn target(&self) -> Target {
        match &self.connection {
            Some(connection) => Target::Remote(connection.clone()),
            None => Target::Local,
        }
    }

    /// Reject definitions that can never run
    ///
    /// # Errors
    /// Returns `CoreError::InvalidResource` describing the problem
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.options.command.is_empty() {
            return Err(CoreError::invalid(
                &self.name,
                "use create, update or delete instead of command",
            ));
        }
        if let Some(connection) = &self.connection {
            connection.validate()?;
            if self.options.wants_harvest() {
                return Err(CoreError::invalid(
                    &self.name,
                    "assetPaths and archivePaths are only supported for local commands",
                ));
            }
        }
        Ok(())
    }

    /// Hash of every input except the name and the triggers
    ///
    /// # Errors
    /// Returns `CoreError::InvalidResource` if the inputs cannot be encoded
    pub fn inputs_hash(&self) -> Result<String, CoreError> {
        let mut options = self.options.clone();
        let environment: BTreeMap<String, String> =
            std::mem::take(&mut options.environment).into_iter().collect();
        self.digest(&(
            &self.connection,
            &self.create,
            &self.update,
            &self.delete,
            &self.logging,
            &options,
            &environment,
        ))
    }

    /// Hash of the triggers
    ///
    /// # Errors
    /// Returns `CoreError::InvalidResource` if the triggers cannot be encoded
    pub fn triggers_hash(&self) -> Result<String, CoreError> {
        self.digest(&self.triggers)
    }

    fn digest(&self, value: &impl Serialize) -> Result<String, CoreError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| CoreError::invalid(&self.name, format!("cannot hash inputs: {e}")))?;
        Ok(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Compare the definition against what was applied last
    ///
    /// # Errors
    /// Returns `CoreError::InvalidResource` if the inputs cannot be hashed
    pub fn plan(&self, applied: Option<&CommandState>) -> Result<CommandChange, CoreError> {
        let Some(applied) = applied else {
            return Ok(CommandChange::Create);
        };
        if applied.triggers_hash != self.triggers_hash()? {
            return Ok(CommandChange::Replace);
        }
        if applied.inputs_hash != self.inputs_hash()? {
            return Ok(CommandChange::Update);
        }
        Ok(CommandChange::Unchanged)
    }

    /// Record `result` together with the inputs that produced it
    ///
    /// # Errors
    /// Returns `CoreError::InvalidResource` if the inputs cannot be hashed
    pub fn state(&self, result: ExecutionResult) -> Result<CommandState, CoreError> {
        Ok(CommandState {
            result,
            inputs_hash: self.inputs_hash()?,
            triggers_hash: self.triggers_hash()?,
        })
    }

    fn step(&self, command: &str) -> CommandSpec {
        self.options.clone().with_command(command)
    }

    /// Run the create command
    ///
    /// A preview returns a placeholder; a resource without a create command
    /// gets a fresh id and empty output.
    ///
    /// # Errors
    /// Returns `CoreError` if validation or the command fails
    #[instrument(skip_all, fields(resource = %self.name, preview = preview))]
    pub async fn create(
        &self,
        runner: &dyn CommandRunner,
        mode: LogMode,
        preview: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, CoreError> {
        self.validate()?;
        if preview {
            return Ok(ExecutionResult::placeholder());
        }
        let Some(command) = &self.create else {
            debug!("no create command");
            return Ok(ExecutionResult::empty());
        };
        let result = runner.run(&self.step(command), None, mode, cancel).await?;
        info!(id = %result.id, "created");
        Ok(result)
    }

    /// Run the update command, or the create command when there is none
    ///
    /// The previous state's output is exposed to the command and its id is
    /// kept.
    ///
    /// # Errors
    /// Returns `CoreError` if validation or the command fails
    #[instrument(skip_all, fields(resource = %self.name, id = %previous.id, preview = preview))]
    pub async fn update(
        &self,
        runner: &dyn CommandRunner,
        previous: &ExecutionResult,
        mode: LogMode,
        preview: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, CoreError> {
        self.validate()?;
        let mut result = if preview {
            ExecutionResult::placeholder()
        } else {
            match self.update.as_ref().or(self.create.as_ref()) {
                Some(command) => {
                    runner
                        .run(&self.step(command), Some(previous), mode, cancel)
                        .await?
                }
                None => ExecutionResult::empty(),
            }
        };
        result.id.clone_from(&previous.id);
        Ok(result)
    }

    /// Run the delete command, if any, with the last output exposed
    ///
    /// # Errors
    /// Returns `CoreError` if the command fails
    #[instrument(skip_all, fields(resource = %self.name, id = %state.id))]
    pub async fn delete(
        &self,
        runner: &dyn CommandRunner,
        state: &ExecutionResult,
        mode: LogMode,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let Some(command) = &self.delete else {
            return Ok(());
        };
        runner
            .run(&self.step(command), Some(state), mode, cancel)
            .await?;
        info!("deleted");
        Ok(())
    }
}
