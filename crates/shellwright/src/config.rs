//! Manifest loading and types

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use shellwright_core::{CommandResource, EngineConfig};
use shellwright_exec::{CommandSpec, ConnectionSpec, CopySpec, LogMode};

/// Top-level manifest for one apply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Validate and report without running, dialing or writing
    #[serde(default)]
    pub preview: bool,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where applied state is kept between runs
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Command resources with create/update/delete steps
    #[serde(default)]
    pub command: Vec<CommandResource>,
    /// Commands executed on every apply
    #[serde(default)]
    pub run: Vec<RunEntry>,
    /// Files, directories and text pushed to remote hosts
    #[serde(default)]
    pub copy: Vec<CopyEntry>,
}

/// A command executed on every apply, without tracked state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEntry {
    pub name: String,
    /// Run remotely when set
    #[serde(default)]
    pub connection: Option<ConnectionSpec>,
    #[serde(default)]
    pub logging: Option<LogMode>,
    #[serde(flatten)]
    pub spec: CommandSpec,
}

/// A named remote copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyEntry {
    pub name: String,
    #[serde(flatten)]
    pub spec: CopySpec,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preview: false,
            log_level: default_log_level(),
            state_path: default_state_path(),
            engine: EngineConfig::default(),
            command: Vec::new(),
            run: Vec::new(),
            copy: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_path() -> PathBuf {
    PathBuf::from("shellwright.state.json")
}

impl Config {
    /// Load and check a manifest file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or if two
    /// resources share a name
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("reading {}: {e}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse a manifest from TOML text
    ///
    /// # Errors
    /// Returns error for invalid TOML or duplicate resource names
    pub fn parse(content: &str) -> eyre::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.check_names()?;
        Ok(config)
    }

    /// Load from the explicit path, `SHELLWRIGHT_CONFIG`, or the common paths
    ///
    /// # Errors
    /// Returns error if no manifest is found or it cannot be loaded
    pub fn load_default(explicit: Option<&Path>) -> eyre::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var("SHELLWRIGHT_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let paths = [
            Some(PathBuf::from("shellwright.toml")),
            Some(PathBuf::from("/etc/shellwright/shellwright.toml")),
            dirs::config_dir().map(|p| p.join("shellwright/shellwright.toml")),
        ];
        for path in paths.into_iter().flatten() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        // a manifest is the whole input, so running without one is an error
        eyre::bail!("no shellwright.toml found; set SHELLWRIGHT_CONFIG or pass --config")
    }

    fn check_names(&self) -> eyre::Result<()> {
        let mut seen = HashSet::new();
        let names = self
            .command
            .iter()
            .map(|c| ("command", c.name.as_str()))
            .chain(self.run.iter().map(|r| ("run", r.name.as_str())))
            .chain(self.copy.iter().map(|c| ("copy", c.name.as_str())));
        for (kind, name) in names {
            if name.is_empty() {
                eyre::bail!("{kind} resource without a name");
            }
            if !seen.insert((kind, name)) {
                eyre::bail!("duplicate {kind} resource {name:?}");
            }
        }
        Ok(())
    }
}
