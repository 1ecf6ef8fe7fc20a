use crate::{Gate, OncePerIntervalGate, RateLimiter, ScheduledDailyGate};
use credentials::{CredentialError, CredentialProvider};
use fetcher::ByteStream;
use russh_sftp::client::SftpSession;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

const READ_CHUNK: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum SftpError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("connection to {host}:{port} timed out")]
    ConnectTimeout { host: String, port: u16 },
    #[error("authentication rejected for user '{0}'")]
    AuthRejected(String),
    #[error("invalid sftp port '{0}'")]
    InvalidPort(String),
}

#[derive(Debug, Clone, Default)]
pub struct FileAttrs {
    pub is_dir: bool,
    pub size: Option<u64>,
    pub mtime: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attrs: FileAttrs,
}

/// Remote file operations behind the SFTP manager. The seam exists so
/// loaders and locators can run against in-memory fakes.
#[async_trait::async_trait]
pub trait SftpClient: Send + Sync {
    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, SftpError>;
    async fn stat(&self, path: &str) -> Result<FileAttrs, SftpError>;
    /// Opens the remote file and returns its contents as an 8 KiB-chunked
    /// stream.
    async fn open_read(&self, path: &str) -> Result<ByteStream, SftpError>;
}

#[derive(Debug, Clone)]
pub struct SftpConfig {
    /// Credential configuration holding `host`, `username`, `password` and
    /// optionally `port`.
    pub config_name: String,
    pub connect_timeout: Duration,
    pub rate_limit_rps: f64,
    /// Host-key verification stays on unless this is set explicitly.
    pub accept_unknown_host_keys: bool,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            config_name: "sftp".to_string(),
            connect_timeout: Duration::from_secs(20),
            rate_limit_rps: 5.0,
            accept_unknown_host_keys: false,
        }
    }
}

/// Authenticated, rate-limited, gated SFTP session.
///
/// SFTP sessions are single-threaded: every operation, including the full
/// read of a remote file into its spool, happens under the session mutex.
pub struct SftpManager {
    config: SftpConfig,
    credentials: Arc<dyn CredentialProvider>,
    limiter: RateLimiter,
    daily_gate: Option<ScheduledDailyGate>,
    interval_gate: Option<OncePerIntervalGate>,
    session: Mutex<Option<Connected>>,
}

struct Connected {
    handle: russh::client::Handle<HostKeyPolicy>,
    sftp: SftpSession,
}

struct HostKeyPolicy {
    accept_unknown: bool,
}

#[async_trait::async_trait]
impl russh::client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Without a known-hosts database, "verification" is a policy choice:
        // refuse unknown keys unless the deployment opted out.
        Ok(self.accept_unknown)
    }
}

impl SftpManager {
    pub fn new(credentials: Arc<dyn CredentialProvider>, config: SftpConfig) -> Self {
        let limiter = RateLimiter::per_second(config.rate_limit_rps);
        Self {
            config,
            credentials,
            limiter,
            daily_gate: None,
            interval_gate: None,
            session: Mutex::new(None),
        }
    }

    pub fn with_daily_gate(mut self, gate: ScheduledDailyGate) -> Self {
        self.daily_gate = Some(gate);
        self
    }

    pub fn with_interval_gate(mut self, gate: OncePerIntervalGate) -> Self {
        self.interval_gate = Some(gate);
        self
    }

    async fn wait_for_gates(&self) {
        if let Some(gate) = &self.daily_gate {
            gate.wait_if_needed().await;
        }
        if let Some(gate) = &self.interval_gate {
            gate.wait_if_needed().await;
        }
    }

    async fn connect(&self) -> Result<Connected, SftpError> {
        let host = self
            .credentials
            .get_credential(&self.config.config_name, "host")
            .await?;
        let username = self
            .credentials
            .get_credential(&self.config.config_name, "username")
            .await?;
        let password = self
            .credentials
            .get_credential(&self.config.config_name, "password")
            .await?;
        let port = match self
            .credentials
            .get_credential(&self.config.config_name, "port")
            .await
        {
            Ok(port) => port
                .parse::<u16>()
                .map_err(|_| SftpError::InvalidPort(port))?,
            Err(CredentialError::Missing { .. }) => 22,
            Err(err) => return Err(err.into()),
        };

        let ssh_config = Arc::new(russh::client::Config::default());
        let policy = HostKeyPolicy {
            accept_unknown: self.config.accept_unknown_host_keys,
        };

        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            russh::client::connect(ssh_config, (host.as_str(), port), policy),
        )
        .await
        .map_err(|_| SftpError::ConnectTimeout {
            host: host.clone(),
            port,
        })??;

        if !handle
            .authenticate_password(username.as_str(), password.as_str())
            .await?
        {
            return Err(SftpError::AuthRejected(username));
        }

        let mut channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;

        tracing::info!(host, port, username, "sftp session established");
        Ok(Connected { handle, sftp })
    }

    /// Gate, rate-limit, then hand back the (lazily created) session guard.
    async fn acquire(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, Option<Connected>>, SftpError> {
        self.wait_for_gates().await;
        self.limiter.acquire().await;

        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.connect().await?);
        }
        Ok(session)
    }

    /// Close the current session. Idempotent; a later call reconnects.
    pub async fn close(&self) {
        if let Some(connected) = self.session.lock().await.take() {
            let _ = connected
                .handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}

#[async_trait::async_trait]
impl SftpClient for SftpManager {
    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, SftpError> {
        let guard = self.acquire().await?;
        let connected = guard.as_ref().expect("session acquired");

        let mut entries = Vec::new();
        for entry in connected.sftp.read_dir(path).await? {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            entries.push(DirEntry {
                name,
                attrs: convert_attrs(&entry.metadata()),
            });
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileAttrs, SftpError> {
        let guard = self.acquire().await?;
        let connected = guard.as_ref().expect("session acquired");
        Ok(convert_attrs(&connected.sftp.metadata(path).await?))
    }

    async fn open_read(&self, path: &str) -> Result<ByteStream, SftpError> {
        let guard = self.acquire().await?;
        let connected = guard.as_ref().expect("session acquired");

        // Spool the remote file while the session is held, then stream from
        // local disk; the anonymous temp file vanishes when the stream drops.
        let mut remote = connected.sftp.open(path).await?;
        let mut spool = tokio::fs::File::from_std(tempfile::tempfile()?);
        tokio::io::copy(&mut remote, &mut spool).await?;
        spool.flush().await?;
        spool.seek(SeekFrom::Start(0)).await?;

        Ok(Box::pin(ReaderStream::with_capacity(spool, READ_CHUNK)))
    }
}

fn convert_attrs(attrs: &russh_sftp::protocol::FileAttributes) -> FileAttrs {
    FileAttrs {
        is_dir: attrs.is_dir(),
        size: attrs.size,
        mtime: attrs.mtime.map(u64::from),
    }
}
