//! SFTP-backed remote filesystem

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::copy::{RemoteFs, RemoteKind};
use crate::error::ExecError;
use crate::ssh::Connection;

/// A remote filesystem reached over one SFTP subsystem channel
pub struct SftpFs {
    session: SftpSession,
}

impl std::fmt::Debug for SftpFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpFs").finish_non_exhaustive()
    }
}

impl SftpFs {
    /// Start the SFTP subsystem on a new channel of `connection`
    ///
    /// # Errors
    /// Returns `ExecError::Sftp` if the server refuses the subsystem
    pub async fn open(connection: &Connection) -> Result<Self, ExecError> {
        let channel = connection.open_session().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ExecError::Sftp(e.to_string()))?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ExecError::Sftp(e.to_string()))?;
        debug!(endpoint = %connection.endpoint(), "SFTP session started");
        Ok(Self { session })
    }

    /// End the SFTP session
    pub async fn close(self) {
        if let Err(e) = self.session.close().await {
            debug!(error = %e, "SFTP close failed");
        }
    }
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn stat(&self, path: &str) -> Result<Option<RemoteKind>, ExecError> {
        match self.session.metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(Some(RemoteKind::Directory)),
            Ok(_) => Ok(Some(RemoteKind::File)),
            Err(SftpError::Status(status)) if status.status_code == StatusCode::NoSuchFile => {
                Ok(None)
            }
            Err(e) => Err(ExecError::Sftp(format!("failed to stat remote path {path}: {e}"))),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), ExecError> {
        self.session.create_dir(path).await.map_err(|e| {
            ExecError::Sftp(format!("failed to create remote directory {path}: {e}"))
        })
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &mut (dyn tokio::io::AsyncRead + Unpin + Send),
    ) -> Result<u64, ExecError> {
        let mut remote = self
            .session
            .create(path)
            .await
            .map_err(|e| ExecError::Sftp(format!("failed to create remote file {path}: {e}")))?;
        let written = tokio::io::copy(contents, &mut remote)
            .await
            .map_err(|e| ExecError::Sftp(format!("failed to write remote file {path}: {e}")))?;
        remote
            .shutdown()
            .await
            .map_err(|e| ExecError::Sftp(format!("failed to close remote file {path}: {e}")))?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::spec::{ConnectionSpec, CopySource};
    use crate::ssh::Dialer;

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_sftp_text_copy() {
        let host = std::env::var("SHELLWRIGHT_TEST_SSH_HOST").unwrap();
        let conn = Dialer::default()
            .dial(&ConnectionSpec::new(host), &CancellationToken::new())
            .await
            .unwrap();
        let fs = SftpFs::open(&conn).await.unwrap();
        crate::copy::copy(&fs, &CopySource::Text("hi".to_string()), "/tmp/shellwright-test")
            .await
            .unwrap();
        assert_eq!(
            fs.stat("/tmp/shellwright-test").await.unwrap(),
            Some(RemoteKind::File)
        );
        fs.close().await;
        conn.close().await;
    }
}
