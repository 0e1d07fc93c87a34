//! SSH key loading and agent discovery

use std::env;
use std::path::{Path, PathBuf};

use russh::keys::{PrivateKey, decode_secret_key};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable naming the default agent socket
pub const AGENT_SOCKET_ENV: &str = "SSH_AUTH_SOCK";

/// Where the private key text comes from
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeySource {
    /// Key contents given inline
    Inline(String),
    /// Path to a key file
    Path(PathBuf),
    /// Base64-encoded key in an environment variable
    Env(String),
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Inline(_) => f.write_str("Inline(<redacted>)"),
            KeySource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            KeySource::Env(var) => f.debug_tuple("Env").field(var).finish(),
        }
    }
}

impl KeySource {
    /// Read the key text
    ///
    /// # Errors
    /// Returns `KeyError` if the key cannot be obtained (env not set, invalid base64, etc.)
    pub fn read(&self) -> Result<String, KeyError> {
        match self {
            KeySource::Inline(text) => Ok(text.clone()),
            KeySource::Path(path) => {
                if !path.exists() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(path)?;
                debug!(path = %path.display(), "reading private key");
                Ok(std::fs::read_to_string(path)?)
            }
            KeySource::Env(var_name) => {
                let encoded =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let bytes = base64_decode(&encoded).map_err(|_| KeyError::InvalidBase64)?;
                String::from_utf8(bytes).map_err(|_| KeyError::InvalidBase64)
            }
        }
    }

    /// Read and decode the key, decrypting it with `passphrase` when given
    ///
    /// # Errors
    /// Returns `KeyError::Decode` if the key is malformed or the passphrase is wrong
    pub fn load(&self, passphrase: Option<&str>) -> Result<PrivateKey, KeyError> {
        let text = self.read()?;
        decode_secret_key(&text, passphrase).map_err(|e| KeyError::Decode(e.to_string()))
    }
}

/// Agent socket to use: the explicit path, else `SSH_AUTH_SOCK`
#[must_use]
pub fn agent_socket(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| {
        env::var_os(AGENT_SOCKET_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
}

/// Key loading errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("could not decode private key: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}
