//! Input specifications for command runs, connections and copies

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::keys::KeySource;
use crate::result::ExecutionResult;

/// Environment variable carrying the stdout of the previous run
pub const PREVIOUS_STDOUT_VAR: &str = "SHELLWRIGHT_COMMAND_STDOUT";
/// Environment variable carrying the stderr of the previous run
pub const PREVIOUS_STDERR_VAR: &str = "SHELLWRIGHT_COMMAND_STDERR";

/// Which output streams are mirrored to the log sink
///
/// Never affects what ends up in the captured result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogMode {
    /// Log stdout only
    Stdout,
    /// Log stderr only
    Stderr,
    /// Log both streams
    #[default]
    StdoutAndStderr,
    /// Log nothing
    None,
}

impl LogMode {
    #[must_use]
    pub fn logs_stdout(self) -> bool {
        matches!(self, LogMode::Stdout | LogMode::StdoutAndStderr)
    }

    #[must_use]
    pub fn logs_stderr(self) -> bool {
        matches!(self, LogMode::Stderr | LogMode::StdoutAndStderr)
    }
}

/// A command to run, locally or on a remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    /// Program and leading arguments; the command text is appended last
    #[serde(default)]
    pub interpreter: Vec<String>,
    /// Working directory (defaults to the current directory)
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Additional environment variables
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Text fed to the command's standard input
    #[serde(default)]
    pub stdin: Option<String>,
    /// The command text
    #[serde(default)]
    pub command: String,
    /// Globs selecting files to return as individual assets
    #[serde(default)]
    pub asset_paths: Option<Vec<String>>,
    /// Globs selecting files to return as one archive
    #[serde(default)]
    pub archive_paths: Option<Vec<String>>,
    /// Expose the previous run's output through the reserved variables
    #[serde(default = "default_true")]
    pub add_previous_output_in_env: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self {
            interpreter: Vec::new(),
            dir: None,
            environment: HashMap::new(),
            stdin: None,
            command: String::new(),
            asset_paths: None,
            archive_paths: None,
            add_previous_output_in_env: true,
        }
    }
}

impl CommandSpec {
    /// Create a spec for the given command text
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Replace the command text, keeping everything else
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    #[must_use]
    pub fn with_interpreter<I, S>(mut self, interpreter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interpreter = interpreter.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    #[must_use]
    pub fn with_asset_paths(mut self, globs: Vec<String>) -> Self {
        self.asset_paths = Some(globs);
        self
    }

    #[must_use]
    pub fn with_archive_paths(mut self, globs: Vec<String>) -> Self {
        self.archive_paths = Some(globs);
        self
    }

    /// Do not expose the previous run's output to the command
    #[must_use]
    pub fn without_previous_output(mut self) -> Self {
        self.add_previous_output_in_env = false;
        self
    }

    /// Full argument vector: interpreter followed by the command text
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        let mut args = if self.interpreter.is_empty() {
            default_interpreter()
        } else {
            self.interpreter.clone()
        };
        args.push(self.command.clone());
        args
    }

    /// Stdin bytes, if any were given
    #[must_use]
    pub fn stdin_bytes(&self) -> Option<&[u8]> {
        self.stdin
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::as_bytes)
    }

    /// The reserved variables to set for this run, if injection is enabled
    ///
    /// Empty previous streams are not exported.
    #[must_use]
    pub fn previous_output_env(
        &self,
        previous: Option<&ExecutionResult>,
    ) -> Vec<(&'static str, String)> {
        let Some(previous) = previous.filter(|_| self.add_previous_output_in_env) else {
            return Vec::new();
        };
        let mut vars = Vec::with_capacity(2);
        if !previous.stdout.is_empty() {
            vars.push((PREVIOUS_STDOUT_VAR, previous.stdout.clone()));
        }
        if !previous.stderr.is_empty() {
            vars.push((PREVIOUS_STDERR_VAR, previous.stderr.clone()));
        }
        vars
    }

    /// Whether any post-run globbing was requested
    #[must_use]
    pub fn wants_harvest(&self) -> bool {
        self.asset_paths.is_some() || self.archive_paths.is_some()
    }
}

/// Interpreter used when a spec leaves it empty
#[must_use]
pub fn default_interpreter() -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".to_string(), "/C".to_string()]
    } else {
        vec!["/bin/sh".to_string(), "-c".to_string()]
    }
}

/// How many failed dial attempts are tolerated before giving up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum DialErrorLimit {
    /// Give up once this many attempts have failed and one more fails
    Limited(u32),
    /// Retry until success or cancellation
    Unlimited,
}

impl DialErrorLimit {
    /// Whether `failures` failed attempts exceed the limit
    #[must_use]
    pub fn exceeded(self, failures: u32) -> bool {
        match self {
            DialErrorLimit::Limited(limit) => failures > limit,
            DialErrorLimit::Unlimited => false,
        }
    }
}

impl Default for DialErrorLimit {
    fn default() -> Self {
        DialErrorLimit::Limited(10)
    }
}

impl TryFrom<i64> for DialErrorLimit {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(DialErrorLimit::Unlimited),
            v => u32::try_from(v)
                .map(DialErrorLimit::Limited)
                .map_err(|_| format!("dial error limit must be -1 or non-negative, got {v}")),
        }
    }
}

impl From<DialErrorLimit> for i64 {
    fn from(limit: DialErrorLimit) -> Self {
        match limit {
            DialErrorLimit::Limited(n) => i64::from(n),
            DialErrorLimit::Unlimited => -1,
        }
    }
}

impl fmt::Display for DialErrorLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialErrorLimit::Limited(n) => write!(f, "{n}"),
            DialErrorLimit::Unlimited => f.write_str("inf"),
        }
    }
}

/// Address and credentials of one SSH hop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSpec {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username (default root)
    #[serde(default = "default_user")]
    pub user: String,
    /// Password, also used for keyboard-interactive prompts
    #[serde(default)]
    pub password: Option<String>,
    /// Private key, tried before the password
    #[serde(default)]
    pub private_key: Option<KeySource>,
    /// Passphrase for an encrypted private key
    #[serde(default)]
    pub private_key_password: Option<String>,
    /// SSH agent socket (defaults to `SSH_AUTH_SOCK`)
    #[serde(default)]
    pub agent_socket_path: Option<PathBuf>,
    /// Failed dial attempts tolerated (-1 for unlimited)
    #[serde(default)]
    pub dial_error_limit: DialErrorLimit,
    /// Seconds allowed per dial attempt (0 for no bound)
    #[serde(default = "default_per_dial_timeout")]
    pub per_dial_timeout: u64,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

fn default_per_dial_timeout() -> u64 {
    15
}

impl HostSpec {
    /// Create a hop with default port, user and limits
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: default_user(),
            password: None,
            private_key: None,
            private_key_password: None,
            agent_socket_path: None,
            dial_error_limit: DialErrorLimit::default(),
            per_dial_timeout: default_per_dial_timeout(),
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_private_key(mut self, key: KeySource, passphrase: Option<String>) -> Self {
        self.private_key = Some(key);
        self.private_key_password = passphrase;
        self
    }

    #[must_use]
    pub fn with_agent_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.agent_socket_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_dial_error_limit(mut self, limit: DialErrorLimit) -> Self {
        self.dial_error_limit = limit;
        self
    }

    #[must_use]
    pub fn with_per_dial_timeout(mut self, seconds: u64) -> Self {
        self.per_dial_timeout = seconds;
        self
    }

    /// Per-attempt bound, `None` when disabled
    #[must_use]
    pub fn dial_timeout(&self) -> Option<Duration> {
        (self.per_dial_timeout > 0).then(|| Duration::from_secs(self.per_dial_timeout))
    }

    /// `host:port` for messages
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), ExecError> {
        if self.host.trim().is_empty() {
            return Err(ExecError::InvalidInput(
                "connection host is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// How to reach a remote host, optionally through one bastion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    /// Target host
    #[serde(flatten)]
    pub target: HostSpec,
    /// Bastion hop used to reach the target
    #[serde(default)]
    pub proxy: Option<HostSpec>,
}

impl ConnectionSpec {
    /// Direct connection to `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            target: HostSpec::new(host),
            proxy: None,
        }
    }

    /// Reach the target through `proxy`
    #[must_use]
    pub fn via(mut self, proxy: HostSpec) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Reject specs that can never dial
    ///
    /// # Errors
    /// Returns `ExecError::InvalidInput` when a host is missing
    pub fn validate(&self) -> Result<(), ExecError> {
        self.target.validate()?;
        if let Some(proxy) = &self.proxy {
            proxy.validate().map_err(ExecError::proxy)?;
        }
        Ok(())
    }
}

impl From<HostSpec> for ConnectionSpec {
    fn from(target: HostSpec) -> Self {
        Self {
            target,
            proxy: None,
        }
    }
}

/// Where a command runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// On this machine
    Local,
    /// On a remote host over SSH
    Remote(ConnectionSpec),
}

/// What to copy to the remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCopySource", into = "RawCopySource")]
pub enum CopySource {
    /// A single local file
    File(PathBuf),
    /// A local directory; `contents_only` when given with a trailing slash
    Directory {
        /// Directory path
        path: PathBuf,
        /// Copy the directory's contents rather than the directory itself
        contents_only: bool,
    },
    /// Literal text written to the destination file
    Text(String),
}

impl CopySource {
    /// Directory source; a trailing separator selects its contents
    pub fn directory(path: impl AsRef<str>) -> Self {
        let raw = path.as_ref();
        let contents_only = raw.ends_with('/') || (cfg!(windows) && raw.ends_with('\\'));
        CopySource::Directory {
            path: PathBuf::from(raw),
            contents_only,
        }
    }

    /// Build a source from optional parts, exactly one of which must be set
    ///
    /// # Errors
    /// Returns `ExecError::InvalidInput` when zero or several parts are set
    pub fn from_parts(
        file: Option<PathBuf>,
        directory: Option<String>,
        text: Option<String>,
    ) -> Result<Self, ExecError> {
        match (file, directory, text) {
            (Some(file), None, None) => Ok(CopySource::File(file)),
            (None, Some(dir), None) => Ok(CopySource::directory(dir)),
            (None, None, Some(text)) => Ok(CopySource::Text(text)),
            (None, None, None) => Err(ExecError::InvalidInput(
                "one of file, directory or text must be set".to_string(),
            )),
            _ => Err(ExecError::InvalidInput(
                "only one of file, directory or text can be set".to_string(),
            )),
        }
    }

    /// Local path of a path-based source
    #[must_use]
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            CopySource::File(path) | CopySource::Directory { path, .. } => Some(path),
            CopySource::Text(_) => None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCopySource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

impl TryFrom<RawCopySource> for CopySource {
    type Error = ExecError;

    fn try_from(raw: RawCopySource) -> Result<Self, Self::Error> {
        CopySource::from_parts(raw.file, raw.directory, raw.text)
    }
}

impl From<CopySource> for RawCopySource {
    fn from(source: CopySource) -> Self {
        match source {
            CopySource::File(file) => RawCopySource {
                file: Some(file),
                ..Self::default()
            },
            CopySource::Directory {
                path,
                contents_only,
            } => {
                let mut dir = path.to_string_lossy().into_owned();
                if contents_only && !dir.ends_with('/') {
                    dir.push('/');
                }
                RawCopySource {
                    directory: Some(dir),
                    ..Self::default()
                }
            }
            CopySource::Text(text) => RawCopySource {
                text: Some(text),
                ..Self::default()
            },
        }
    }
}

/// A copy of local content to a remote path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopySpec {
    /// How to reach the remote host
    pub connection: ConnectionSpec,
    /// What to copy
    pub source: CopySource,
    /// Destination on the remote host
    pub remote_path: String,
}

impl CopySpec {
    pub fn new(
        connection: ConnectionSpec,
        source: CopySource,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            source,
            remote_path: remote_path.into(),
        }
    }

    /// Validate everything that can be checked without I/O
    ///
    /// # Errors
    /// Returns `ExecError::InvalidInput` for a missing host or remote path
    pub fn validate(&self) -> Result<(), ExecError> {
        self.connection.validate()?;
        if self.remote_path.trim().is_empty() {
            return Err(ExecError::InvalidInput(
                "remote path is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Content hash of the source, used to detect no-op updates
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if the local source cannot be read
    pub fn content_hash(&self) -> Result<String, ExecError> {
        crate::copy::hash_source(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_argv() {
        let spec = CommandSpec::new("echo hi");
        let argv = spec.argv();
        assert_eq!(argv.last().map(String::as_str), Some("echo hi"));
        if cfg!(windows) {
            assert_eq!(argv[..2], ["cmd", "/C"]);
        } else {
            assert_eq!(argv[..2], ["/bin/sh", "-c"]);
        }
    }

    #[test]
    fn test_custom_interpreter() {
        let spec = CommandSpec::new("print(1)").with_interpreter(["python3", "-c"]);
        assert_eq!(spec.argv(), vec!["python3", "-c", "print(1)"]);
    }

    #[test]
    fn test_previous_output_env() {
        let previous = ExecutionResult::new("out".to_string(), String::new());
        let spec = CommandSpec::new("true");
        assert_eq!(
            spec.previous_output_env(Some(&previous)),
            vec![(PREVIOUS_STDOUT_VAR, "out".to_string())]
        );
        assert!(spec.previous_output_env(None).is_empty());
        assert!(
            spec.without_previous_output()
                .previous_output_env(Some(&previous))
                .is_empty()
        );
    }

    #[test]
    fn test_log_mode_gates() {
        assert!(LogMode::Stdout.logs_stdout() && !LogMode::Stdout.logs_stderr());
        assert!(!LogMode::Stderr.logs_stdout() && LogMode::Stderr.logs_stderr());
        assert!(LogMode::StdoutAndStderr.logs_stdout() && LogMode::StdoutAndStderr.logs_stderr());
        assert!(!LogMode::None.logs_stdout() && !LogMode::None.logs_stderr());
        assert_eq!(LogMode::default(), LogMode::StdoutAndStderr);
    }

    #[test]
    fn test_log_mode_names() {
        let mode: LogMode = serde_json::from_str("\"stdoutAndStderr\"").unwrap();
        assert_eq!(mode, LogMode::StdoutAndStderr);
        let mode: LogMode = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(mode, LogMode::None);
    }

    #[test]
    fn test_dial_error_limit() {
        assert_eq!(DialErrorLimit::default(), DialErrorLimit::Limited(10));
        assert_eq!(DialErrorLimit::try_from(-1_i64), Ok(DialErrorLimit::Unlimited));
        assert!(DialErrorLimit::try_from(-2_i64).is_err());
        assert!(!DialErrorLimit::Limited(2).exceeded(2));
        assert!(DialErrorLimit::Limited(2).exceeded(3));
        assert!(!DialErrorLimit::Unlimited.exceeded(u32::MAX));
        assert_eq!(DialErrorLimit::Unlimited.to_string(), "inf");
    }

    #[test]
    fn test_connection_defaults() {
        let spec: ConnectionSpec = serde_json::from_str(r#"{"host": "10.0.0.5"}"#).unwrap();
        assert_eq!(spec.target.port, 22);
        assert_eq!(spec.target.user, "root");
        assert_eq!(spec.target.dial_error_limit, DialErrorLimit::Limited(10));
        assert_eq!(spec.target.dial_timeout(), Some(Duration::from_secs(15)));
        assert!(spec.proxy.is_none());
    }

    #[test]
    fn test_connection_with_proxy() {
        let spec: ConnectionSpec = serde_json::from_str(
            r#"{"host": "app", "dialErrorLimit": -1, "perDialTimeout": 0,
                "proxy": {"host": "bastion", "user": "jump", "dialErrorLimit": 3}}"#,
        )
        .unwrap();
        assert_eq!(spec.target.dial_error_limit, DialErrorLimit::Unlimited);
        assert_eq!(spec.target.dial_timeout(), None);
        let proxy = spec.proxy.unwrap();
        assert_eq!(proxy.user, "jump");
        assert_eq!(proxy.dial_error_limit, DialErrorLimit::Limited(3));
    }

    #[test]
    fn test_missing_host_rejected() {
        let spec = ConnectionSpec::new("  ");
        assert!(matches!(spec.validate(), Err(ExecError::InvalidInput(_))));

        let spec = ConnectionSpec::new("app").via(HostSpec::new(""));
        assert!(matches!(spec.validate(), Err(ExecError::Proxy(_))));
    }

    #[test]
    fn test_copy_source_exactly_one() {
        assert!(CopySource::from_parts(None, None, None).is_err());
        assert!(
            CopySource::from_parts(Some("a".into()), None, Some("t".to_string())).is_err()
        );
        assert_eq!(
            CopySource::from_parts(None, None, Some("t".to_string())).unwrap(),
            CopySource::Text("t".to_string())
        );
    }

    #[test]
    fn test_copy_source_trailing_slash() {
        assert!(matches!(
            CopySource::directory("src/"),
            CopySource::Directory {
                contents_only: true,
                ..
            }
        ));
        assert!(matches!(
            CopySource::directory("src"),
            CopySource::Directory {
                contents_only: false,
                ..
            }
        ));
    }

    #[test]
    fn test_copy_source_serde() {
        let source: CopySource = serde_json::from_str(r#"{"directory": "site/"}"#).unwrap();
        assert_eq!(source, CopySource::directory("site/"));
        assert!(serde_json::from_str::<CopySource>(r#"{"file": "a", "text": "b"}"#).is_err());
        assert!(serde_json::from_str::<CopySource>("{}").is_err());

        let json = serde_json::to_string(&CopySource::directory("site/")).unwrap();
        assert_eq!(json, r#"{"directory":"site/"}"#);
    }
}
