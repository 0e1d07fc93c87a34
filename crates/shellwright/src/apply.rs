//! Applying and destroying the resources of a manifest

use serde::Serialize;
use shellwright_core::{CommandChange, CoreError, Engine};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::state::State;

/// What happened to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Created,
    Updated,
    Replaced,
    Unchanged,
    Ran,
    Copied,
    Deleted,
    Previewed,
}

/// One line of the apply report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub kind: &'static str,
    pub name: String,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
}

impl Outcome {
    fn new(kind: &'static str, name: &str, action: Action) -> Self {
        Self {
            kind,
            name: name.to_string(),
            action,
            id: None,
            stdout: None,
        }
    }
}

/// Bring every resource of `config` to its declared state
///
/// A command resource whose inputs match the applied state is left alone;
/// changed inputs run its update step and changed triggers replace it.
///
/// `state` is updated as each resource succeeds, so the caller can persist
/// progress even when a later resource fails. A preview leaves it untouched.
///
/// # Errors
/// Returns the first resource failure
pub async fn apply(
    engine: &Engine,
    config: &Config,
    state: &mut State,
    preview: bool,
    cancel: &CancellationToken,
) -> eyre::Result<Vec<Outcome>> {
    let mut report = Vec::new();

    if !preview {
        let commands: Vec<&str> = config.command.iter().map(|c| c.name.as_str()).collect();
        let copies: Vec<&str> = config.copy.iter().map(|c| c.name.as_str()).collect();
        let before = state.command.len() + state.copy.len();
        state.retain(&commands, &copies);
        let dropped = before - state.command.len() - state.copy.len();
        if dropped > 0 {
            warn!(dropped, "forgetting state of resources no longer declared");
        }
    }

    for resource in &config.command {
        let runner = engine.runner(&resource.target());
        let mode = engine.config().logging(resource.logging);
        let failed = |e: CoreError| eyre::eyre!("command {:?}: {e}", resource.name);
        let applied = state.command.get(&resource.name).cloned();
        let change = resource.plan(applied.as_ref()).map_err(failed)?;

        let result = match (change, &applied) {
            (CommandChange::Unchanged, Some(applied)) => {
                debug!(resource = %resource.name, "inputs unchanged");
                let mut outcome = Outcome::new("command", &resource.name, Action::Unchanged);
                outcome.id = Some(applied.result.id.clone());
                report.push(outcome);
                continue;
            }
            (CommandChange::Update, Some(applied)) => {
                resource
                    .update(runner.as_ref(), &applied.result, mode, preview, cancel)
                    .await
            }
            (CommandChange::Replace, Some(applied)) if !preview => {
                // the previous instance is deleted with the current definition
                resource
                    .delete(runner.as_ref(), &applied.result, mode, cancel)
                    .await
                    .map_err(failed)?;
                state.command.remove(&resource.name);
                resource.create(runner.as_ref(), mode, preview, cancel).await
            }
            _ => resource.create(runner.as_ref(), mode, preview, cancel).await,
        }
        .map_err(failed)?;

        let action = match change {
            _ if preview => Action::Previewed,
            CommandChange::Update => Action::Updated,
            CommandChange::Replace => Action::Replaced,
            CommandChange::Create | CommandChange::Unchanged => Action::Created,
        };
        let mut outcome = Outcome::new("command", &resource.name, action);
        outcome.id = Some(result.id.clone());
        if !preview {
            outcome.stdout = Some(result.stdout.clone());
            let applied = resource.state(result).map_err(failed)?;
            state.command.insert(resource.name.clone(), applied);
        }
        report.push(outcome);
    }

    for entry in &config.run {
        let result = match &entry.connection {
            Some(connection) => {
                engine
                    .run_remote(connection, &entry.spec, None, entry.logging, preview, cancel)
                    .await
            }
            None => {
                engine
                    .run_local(&entry.spec, None, entry.logging, preview, cancel)
                    .await
            }
        }
        .map_err(|e| eyre::eyre!("run {:?}: {e}", entry.name))?;

        let action = if preview { Action::Previewed } else { Action::Ran };
        let mut outcome = Outcome::new("run", &entry.name, action);
        if !preview {
            outcome.stdout = Some(result.stdout);
        }
        report.push(outcome);
    }

    for entry in &config.copy {
        let (copy, action) = match state.copy.get(&entry.name) {
            Some(old) => {
                let (new, changed) = engine
                    .update_copy(old, &entry.spec, preview, cancel)
                    .await
                    .map_err(|e| eyre::eyre!("copy {:?}: {e}", entry.name))?;
                (new, if changed { Action::Copied } else { Action::Unchanged })
            }
            None => {
                let new = engine
                    .copy_to_remote(&entry.spec, preview, cancel)
                    .await
                    .map_err(|e| eyre::eyre!("copy {:?}: {e}", entry.name))?;
                (new, Action::Copied)
            }
        };

        let action = if preview { Action::Previewed } else { action };
        let mut outcome = Outcome::new("copy", &entry.name, action);
        outcome.id = Some(copy.id.clone());
        if !preview {
            state.copy.insert(entry.name.clone(), copy);
        }
        report.push(outcome);
    }

    info!(resources = report.len(), preview, "apply finished");
    Ok(report)
}

/// Run the delete command of every applied command resource
///
/// Copies are only forgotten; nothing is removed from remote hosts.
///
/// # Errors
/// Returns the first delete failure
pub async fn destroy(
    engine: &Engine,
    config: &Config,
    state: &mut State,
    preview: bool,
    cancel: &CancellationToken,
) -> eyre::Result<Vec<Outcome>> {
    let mut report = Vec::new();

    // reverse declaration order, so later resources go first
    for resource in config.command.iter().rev() {
        let Some(applied) = state.command.get(&resource.name) else {
            continue;
        };
        let action = if preview {
            Action::Previewed
        } else {
            let runner = engine.runner(&resource.target());
            let mode = engine.config().logging(resource.logging);
            resource
                .delete(runner.as_ref(), &applied.result, mode, cancel)
                .await
                .map_err(|e| eyre::eyre!("command {:?}: {e}", resource.name))?;
            state.command.remove(&resource.name);
            Action::Deleted
        };
        report.push(Outcome::new("command", &resource.name, action));
    }

    if !preview {
        for name in std::mem::take(&mut state.copy).into_keys() {
            report.push(Outcome::new("copy", &name, Action::Deleted));
        }
    }

    info!(resources = report.len(), preview, "destroy finished");
    Ok(report)
}
