//! SSH connection dialing using the russh crate
//!
//! A direct connection is one retried stage ("Dial"). A proxied connection
//! is three: "Dial proxy" against the bastion with its own limits, "Dial from
//! proxy" to open a `direct-tcpip` tunnel to the target, and "Dial" to run the
//! target handshake over that tunnel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, ssh_key};
use russh::{Channel, Disconnect, client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecError;
use crate::keys;
use crate::output::{LogSink, TracingSink};
use crate::retry::{DEFAULT_RETRY_DELAY, RetryPolicy, dial_with_retry};
use crate::spec::{ConnectionSpec, HostSpec};

/// SSH client handler for russh
#[derive(Debug)]
pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // host identities are not verified
        Ok(true)
    }
}

/// An authenticated connection, possibly tunneled through a bastion
pub struct Connection {
    handle: client::Handle<ClientHandler>,
    proxy: Option<client::Handle<ClientHandler>>,
    endpoint: String,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("proxied", &self.proxy.is_some())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// `host:port` of the target
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open a new session channel on the target
    ///
    /// # Errors
    /// Returns `ExecError::SessionError` if the server refuses the channel
    pub async fn open_session(&self) -> Result<Channel<client::Msg>, ExecError> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::SessionError(e.to_string()))
    }

    /// Disconnect from the target, then from the bastion
    pub async fn close(self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(endpoint = %self.endpoint, error = %e, "disconnect failed");
        }
        if let Some(proxy) = self.proxy {
            if let Err(e) = proxy
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                debug!(error = %e, "proxy disconnect failed");
            }
        }
        debug!(endpoint = %self.endpoint, "SSH disconnected");
    }
}

/// Everything needed to authenticate one hop, resolved before any dialing
struct Credentials {
    user: String,
    key: Option<Arc<PrivateKey>>,
    password: Option<String>,
    agent: Option<PathBuf>,
}

impl Credentials {
    fn resolve(host: &HostSpec) -> Result<Self, ExecError> {
        let key = host
            .private_key
            .as_ref()
            .map(|source| source.load(host.private_key_password.as_deref()))
            .transpose()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?
            .map(Arc::new);

        Ok(Self {
            user: host.user.clone(),
            key,
            password: host.password.clone(),
            agent: keys::agent_socket(host.agent_socket_path.as_deref()),
        })
    }

    fn is_empty(&self) -> bool {
        self.key.is_none() && self.password.is_none() && self.agent.is_none()
    }
}

/// Establishes SSH connections with bounded retry
#[derive(Clone)]
pub struct Dialer {
    retry_delay: Duration,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl Dialer {
    /// Create a dialer reporting retries to `sink`
    #[must_use]
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            sink,
        }
    }

    /// Set the pause between attempts of a stage
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Dial and authenticate, going through the proxy when one is set
    ///
    /// Failures on the bastion side are wrapped in `ExecError::Proxy`.
    ///
    /// # Errors
    /// Returns `ExecError::InvalidInput` or `ExecError::SshKeyError` before
    /// any network activity, `ExecError::DialExhausted` when a stage runs out
    /// of attempts, and `ExecError::Cancelled` when `cancel` fires
    #[instrument(skip_all, fields(host = %spec.target.host))]
    pub async fn dial(
        &self,
        spec: &ConnectionSpec,
        cancel: &CancellationToken,
    ) -> Result<Connection, ExecError> {
        spec.validate()?;
        let target = &spec.target;
        let target_creds = Credentials::resolve(target)?;

        let Some(proxy) = &spec.proxy else {
            let handle = self.dial_direct("Dial", target, &target_creds, cancel).await?;
            info!(endpoint = %target.endpoint(), "SSH connected");
            return Ok(Connection {
                handle,
                proxy: None,
                endpoint: target.endpoint(),
            });
        };

        let proxy_creds = Credentials::resolve(proxy).map_err(ExecError::proxy)?;
        let proxy_handle = self
            .dial_direct("Dial proxy", proxy, &proxy_creds, cancel)
            .await
            .map_err(ExecError::proxy)?;
        info!(proxy = %proxy.endpoint(), "SSH connected to proxy");

        let policy = RetryPolicy::for_host(target, self.retry_delay);
        let tunnel = dial_with_retry(
            "Dial from proxy",
            &policy,
            cancel,
            self.sink.as_ref(),
            |_| open_tunnel(&proxy_handle, target),
        )
        .await
        .map_err(ExecError::proxy)?;

        // the first handshake reuses the tunnel; retries need a fresh one
        let mut first = Some(tunnel);
        let config = client_config();
        let handle = dial_with_retry("Dial", &policy, cancel, self.sink.as_ref(), |_| {
            let reused = first.take();
            let config = config.clone();
            let proxy_handle = &proxy_handle;
            let creds = &target_creds;
            async move {
                let channel = match reused {
                    Some(channel) => channel,
                    None => open_tunnel(proxy_handle, target).await?,
                };
                let mut handle = client::connect_stream(config, channel.into_stream(), ClientHandler)
                    .await
                    .map_err(|e| {
                        ExecError::ConnectionFailed(format!("{}: {e}", target.endpoint()))
                    })?;
                authenticate(&mut handle, creds, &target.endpoint()).await?;
                Ok(handle)
            }
        })
        .await?;

        info!(endpoint = %target.endpoint(), proxy = %proxy.endpoint(), "SSH connected through proxy");
        Ok(Connection {
            handle,
            proxy: Some(proxy_handle),
            endpoint: target.endpoint(),
        })
    }

    async fn dial_direct(
        &self,
        stage: &str,
        host: &HostSpec,
        creds: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<client::Handle<ClientHandler>, ExecError> {
        let policy = RetryPolicy::for_host(host, self.retry_delay);
        let config = client_config();
        let endpoint = host.endpoint();

        dial_with_retry(stage, &policy, cancel, self.sink.as_ref(), |attempt| {
            let config = config.clone();
            let endpoint = &endpoint;
            async move {
                debug!(endpoint = %endpoint, attempt, user = %creds.user, "connecting to SSH");
                let mut handle = client::connect(config, (host.host.as_str(), host.port), ClientHandler)
                    .await
                    .map_err(|e| ExecError::ConnectionFailed(format!("{endpoint}: {e}")))?;
                authenticate(&mut handle, creds, endpoint).await?;
                Ok(handle)
            }
        })
        .await
    }
}

fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config::default())
}

async fn open_tunnel(
    proxy: &client::Handle<ClientHandler>,
    target: &HostSpec,
) -> Result<Channel<client::Msg>, ExecError> {
    proxy
        .channel_open_direct_tcpip(target.host.clone(), u32::from(target.port), "127.0.0.1", 0)
        .await
        .map_err(|e| ExecError::ConnectionFailed(format!("tunnel to {}: {e}", target.endpoint())))
}

/// Try every supplied credential in order: key, password, agent
async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    creds: &Credentials,
    endpoint: &str,
) -> Result<(), ExecError> {
    let user = creds.user.as_str();
    let auth_err = |e: russh::Error| ExecError::AuthenticationFailed(e.to_string());

    if creds.is_empty() {
        let result = handle.authenticate_none(user).await.map_err(auth_err)?;
        if result.success() {
            return Ok(());
        }
        return Err(ExecError::AuthenticationFailed(format!(
            "{user}@{endpoint}: no credentials configured"
        )));
    }

    if let Some(key) = &creds.key {
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let result = handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), hash_alg))
            .await
            .map_err(auth_err)?;
        if result.success() {
            debug!(user, "authenticated with private key");
            return Ok(());
        }
    }

    if let Some(password) = &creds.password {
        let result = handle
            .authenticate_password(user, password)
            .await
            .map_err(auth_err)?;
        if result.success() {
            debug!(user, "authenticated with password");
            return Ok(());
        }
        if keyboard_interactive(handle, user, password).await? {
            debug!(user, "authenticated with keyboard-interactive");
            return Ok(());
        }
    }

    if let Some(socket) = &creds.agent {
        match agent_auth(handle, user, socket).await {
            Ok(true) => {
                debug!(user, "authenticated with agent");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!(socket = %socket.display(), error = %e, "agent authentication failed"),
        }
    }

    Err(ExecError::AuthenticationFailed(format!(
        "{user}@{endpoint}: no supplied credential was accepted"
    )))
}

/// Answer every prompt with the password
async fn keyboard_interactive(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
    password: &str,
) -> Result<bool, ExecError> {
    use client::KeyboardInteractiveAuthResponse as Response;

    let auth_err = |e: russh::Error| ExecError::AuthenticationFailed(e.to_string());
    let mut response = handle
        .authenticate_keyboard_interactive_start(user, None::<String>)
        .await
        .map_err(auth_err)?;
    loop {
        match response {
            Response::Success => return Ok(true),
            Response::Failure { .. } => return Ok(false),
            Response::InfoRequest { prompts, .. } => {
                let answers = vec![password.to_string(); prompts.len()];
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(auth_err)?;
            }
        }
    }
}

#[cfg(unix)]
async fn agent_auth(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
    socket: &std::path::Path,
) -> Result<bool, ExecError> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_uds(socket)
        .await
        .map_err(|e| ExecError::AuthenticationFailed(format!("agent: {e}")))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| ExecError::AuthenticationFailed(format!("agent: {e}")))?;

    for key in identities {
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        match handle
            .authenticate_publickey_with(user, key, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "agent key rejected"),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn agent_auth(
    _handle: &mut client::Handle<ClientHandler>,
    _user: &str,
    _socket: &std::path::Path,
) -> Result<bool, ExecError> {
    Err(ExecError::AuthenticationFailed(
        "agent sockets are only supported on unix".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::keys::KeySource;
    use crate::output::tests::RecordingSink;
    use crate::spec::DialErrorLimit;

    /// Bind then drop a listener to get a local port that refuses connections
    fn refused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn unreachable(limit: u32) -> HostSpec {
        HostSpec::new("127.0.0.1")
            .with_port(refused_port())
            .with_password("secret")
            .with_dial_error_limit(DialErrorLimit::Limited(limit))
    }

    fn dialer(sink: &Arc<RecordingSink>) -> Dialer {
        Dialer::new(sink.clone()).with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_unreachable_host_exhausts_retries() {
        let sink = Arc::new(RecordingSink::default());
        let err = dialer(&sink)
            .dial(&unreachable(2).into(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::DialExhausted { attempts: 3, .. }));
        assert!(err.to_string().starts_with("Dial: after 3 failed attempts"));
        assert_eq!(sink.statuses.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_proxy_failure_is_prefixed() {
        let sink = Arc::new(RecordingSink::default());
        let spec = ConnectionSpec::new("10.0.0.5").via(unreachable(0));
        let err = dialer(&sink)
            .dial(&spec, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Proxy(_)));
        assert!(err.to_string().starts_with("proxy: Dial proxy: after 1 failed attempts"));
    }

    #[tokio::test]
    async fn test_missing_host_rejected_before_dialing() {
        let sink = Arc::new(RecordingSink::default());
        let err = dialer(&sink)
            .dial(&ConnectionSpec::new(""), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidInput(_)));
        assert!(sink.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_key_rejected_before_dialing() {
        let sink = Arc::new(RecordingSink::default());
        let spec = ConnectionSpec::from(
            unreachable(5).with_private_key(KeySource::Inline("garbage".to_string()), None),
        );
        let err = dialer(&sink)
            .dial(&spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SshKeyError(_)));
        assert!(sink.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_dial() {
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let spec = unreachable(0).with_dial_error_limit(DialErrorLimit::Unlimited);
        let err = dialer(&sink).dial(&spec.into(), &cancel).await.unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_ssh_connection() {
        let host = std::env::var("SHELLWRIGHT_TEST_SSH_HOST").unwrap();
        let spec = ConnectionSpec::new(host);
        let conn = Dialer::default()
            .dial(&spec, &CancellationToken::new())
            .await
            .unwrap();
        conn.open_session().await.unwrap();
        conn.close().await;
    }
}
