//! Factory for runners and remote filesystems

use std::sync::Arc;

use async_trait::async_trait;
use shellwright_exec::{
    CommandRunner, ConnectionSpec, Dialer, ExecError, LocalRunner, LogSink, RemoteFs, SftpFs,
    SshRunner, Target, TracingSink,
};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;

/// An open remote filesystem that must be closed after use
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn fs(&self) -> &dyn RemoteFs;

    async fn close(self: Box<Self>);
}

/// Creates the runners and remote sessions the engine drives
#[async_trait]
pub trait Transport: Send + Sync {
    /// Runner for commands executed at `target`
    fn runner(&self, target: &Target) -> Arc<dyn CommandRunner>;

    /// Dial `connection` and open a filesystem session on it
    async fn open_fs(
        &self,
        connection: &ConnectionSpec,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RemoteSession>, ExecError>;
}

/// Local processes, SSH sessions and SFTP
pub struct DefaultTransport {
    dialer: Dialer,
    sink: Arc<dyn LogSink>,
}

impl DefaultTransport {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Mirror output and dial status to `sink`
    #[must_use]
    pub fn with_sink(config: &EngineConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            dialer: Dialer::new(sink.clone()).with_retry_delay(config.dial_retry_delay()),
            sink,
        }
    }
}

struct SftpSession {
    fs: SftpFs,
    connection: shellwright_exec::Connection,
}

#[async_trait]
impl RemoteSession for SftpSession {
    fn fs(&self) -> &dyn RemoteFs {
        &self.fs
    }

    async fn close(self: Box<Self>) {
        let SftpSession { fs, connection } = *self;
        fs.close().await;
        connection.close().await;
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    fn runner(&self, target: &Target) -> Arc<dyn CommandRunner> {
        match target {
            Target::Local => Arc::new(LocalRunner::with_sink(self.sink.clone())),
            Target::Remote(connection) => Arc::new(
                SshRunner::new(connection.clone())
                    .with_dialer(self.dialer.clone(), self.sink.clone()),
            ),
        }
    }

    async fn open_fs(
        &self,
        connection: &ConnectionSpec,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RemoteSession>, ExecError> {
        let connection = self.dialer.dial(connection, cancel).await?;
        let fs = match SftpFs::open(&connection).await {
            Ok(fs) => fs,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };
        Ok(Box::new(SftpSession { fs, connection }))
    }
}
