//! Applied state kept between runs

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use shellwright_core::{CommandState, CopyState};

/// Last known state of every applied resource, keyed by resource name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub command: BTreeMap<String, CommandState>,
    #[serde(default)]
    pub copy: BTreeMap<String, CopyState>,
}

impl State {
    /// Read state from `path`; a missing file is an empty state
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| eyre::eyre!("parsing state {}: {e}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(eyre::eyre!("reading state {}: {e}", path.display())),
        }
    }

    /// Write state to `path` through a temporary file
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn save(&self, path: &Path) -> eyre::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Drop entries for resources no longer in the manifest
    pub fn retain(&mut self, commands: &[&str], copies: &[&str]) {
        self.command.retain(|name, _| commands.contains(&name.as_str()));
        self.copy.retain(|name, _| copies.contains(&name.as_str()));
    }
}
