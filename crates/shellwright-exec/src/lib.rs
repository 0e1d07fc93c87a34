//! shellwright-exec: command and transfer execution engine
//!
//! Runs commands locally or over SSH with dual-stream capture and selective
//! logging, dials SSH hosts directly or through one bastion with bounded
//! retry, and copies files and directories to remote hosts over SFTP.

pub mod copy;
pub mod error;
pub mod glob;
pub mod keys;
pub mod local;
pub mod output;
pub mod result;
pub mod retry;
pub mod session;
pub mod sftp;
pub mod spec;
pub mod ssh;
pub mod traits;

pub use copy::{CopyRecord, RemoteFs, RemoteKind};
pub use error::ExecError;
pub use keys::{KeyError, KeySource};
pub use local::LocalRunner;
pub use output::{LogSink, StreamKind, TracingSink};
pub use result::ExecutionResult;
pub use retry::{DialState, RetryPolicy};
pub use session::SshRunner;
pub use sftp::SftpFs;
pub use spec::{
    CommandSpec, ConnectionSpec, CopySource, CopySpec, DialErrorLimit, HostSpec, LogMode,
    PREVIOUS_STDERR_VAR, PREVIOUS_STDOUT_VAR, Target,
};
pub use ssh::{Connection, Dialer};
pub use traits::CommandRunner;
