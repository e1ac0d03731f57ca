//! Transfer of single remote resources
//!
//! A [`Transfer`] is selected once per operation from the remote URI scheme
//! and then shared by every task of a phase:
//!
//! | Scheme          | Variant           | Mechanism                                  |
//! |-----------------|-------------------|--------------------------------------------|
//! | `http`, `https` | [`Transfer::Http`] | streaming GET over a pooled `reqwest` client |
//! | `scp`           | [`Transfer::Scp`]  | system `scp` in batch mode with a key file |
//! | `ftp`           | [`Transfer::Ftp`]  | `suppaftp` binary RETR on a blocking thread |
//!
//! Any other scheme fails with [`MimicError::UnsupportedProtocol`].
//!
//! [`Transfer::fetch`] reports errors. [`Transfer::fetch_record`] is the
//! batch-friendly form: it never fails, logs the error and resolves to a
//! zero-length, zero-modified [`TransferOutcome`] flagged as failed.

use crate::config::HostSettings;
use crate::error::{MimicError, Result};
use crate::types::ManifestRecord;
use crate::utils;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace, warn};
use url::Url;

/// Account names that mean "no credentials"
const ANONYMOUS: &[&str] = &["anonymous", "."];

/// Default FTP control port
const FTP_PORT: u16 = 21;

/// Password sent for anonymous FTP logins
const FTP_ANONYMOUS_PASSWORD: &str = "anonymous@";

/// Whether a username means anonymous access
pub fn is_anonymous(username: Option<&str>) -> bool {
    match username {
        None => true,
        Some(name) => name.is_empty() || ANONYMOUS.contains(&name),
    }
}

/// Resolve the SSH key for a non-anonymous scp user
///
/// An explicit key has `~` expanded. Without one, `~/.ssh/id_rsa` is used when
/// it exists.
pub fn resolve_key_file(username: Option<&str>, key_file: Option<&str>) -> Option<PathBuf> {
    if is_anonymous(username) {
        return None;
    }
    match key_file {
        Some(key) => Some(utils::expand_home(key)),
        None => dirs::home_dir()
            .map(|home| home.join(".ssh").join("id_rsa"))
            .filter(|key| key.exists()),
    }
}

/// HTTP or HTTPS source
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    base: String,
}

/// SCP source reached through the system `scp` binary
#[derive(Debug, Clone)]
pub struct ScpSource {
    host: String,
    port: Option<u16>,
    path: String,
    username: Option<String>,
    key_file: Option<PathBuf>,
}

/// FTP source
#[derive(Debug, Clone)]
pub struct FtpSource {
    host: String,
    port: u16,
    path: String,
    username: Option<String>,
    password: Option<String>,
}

/// Protocol-specific fetcher for one remote collection
#[derive(Debug, Clone)]
pub enum Transfer {
    /// `http://` and `https://`
    Http(HttpSource),
    /// `scp://`
    Scp(ScpSource),
    /// `ftp://`
    Ftp(FtpSource),
}

/// Result of fetching one manifest record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Remote relative name
    pub name: String,
    /// Bytes written, 0 on failure
    pub bytes: u64,
    /// Modified time applied, 0 on failure
    pub modified: u64,
    /// Failure reason, if any
    pub error: Option<String>,
}

impl TransferOutcome {
    fn done(name: &str, bytes: u64, modified: u64) -> Self {
        Self {
            name: name.to_string(),
            bytes,
            modified,
            error: None,
        }
    }

    fn failed(name: &str, error: &MimicError) -> Self {
        Self {
            name: name.to_string(),
            bytes: 0,
            modified: 0,
            error: Some(error.to_string()),
        }
    }

    /// Whether this item must be counted as failed
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

impl Transfer {
    /// Select the transfer for a URI scheme
    pub fn from_uri(uri: &str, username: Option<&str>, key_file: Option<&str>) -> Result<Self> {
        let url = Url::parse(uri)?;
        let host = || -> Result<String> {
            url.host_str()
                .map(str::to_string)
                .ok_or(MimicError::InvalidUri(url::ParseError::EmptyHost))
        };
        let user = username.filter(|u| !is_anonymous(Some(u))).map(str::to_string);

        let transfer = match url.scheme() {
            "http" | "https" => Transfer::Http(HttpSource {
                client: reqwest::Client::builder()
                    .user_agent(concat!("mimic/", env!("CARGO_PKG_VERSION")))
                    .build()?,
                base: uri.to_string(),
            }),
            "scp" => Transfer::Scp(ScpSource {
                host: host()?,
                port: url.port(),
                path: url.path().to_string(),
                username: user,
                key_file: resolve_key_file(username, key_file),
            }),
            "ftp" => {
                let url_user = Some(url.username()).filter(|u| !u.is_empty());
                Transfer::Ftp(FtpSource {
                    host: host()?,
                    port: url.port().unwrap_or(FTP_PORT),
                    path: url.path().to_string(),
                    username: user.or_else(|| url_user.map(str::to_string)),
                    password: url.password().map(str::to_string),
                })
            }
            other => return Err(MimicError::UnsupportedProtocol(other.to_string())),
        };
        debug!("Selected {} transfer for {}", transfer.scheme(), uri);
        Ok(transfer)
    }

    /// Select the transfer for stored connection settings
    pub fn from_settings(settings: &HostSettings) -> Result<Self> {
        let uri = settings
            .uri
            .as_deref()
            .ok_or_else(|| MimicError::custom("Connection settings have no 'uri'"))?;
        Self::from_uri(uri, settings.username.as_deref(), settings.key_file.as_deref())
    }

    /// Scheme family name
    pub fn scheme(&self) -> &'static str {
        match self {
            Transfer::Http(_) => "http",
            Transfer::Scp(_) => "scp",
            Transfer::Ftp(_) => "ftp",
        }
    }

    /// Fetch `name` (relative to the remote root) into `dest`
    ///
    /// Returns the number of bytes written.
    pub async fn fetch(&self, name: &str, dest: &Path) -> Result<u64> {
        trace!("Fetching {} via {} into {:?}", name, self.scheme(), dest);
        match self {
            Transfer::Http(source) => source.fetch(name, dest).await,
            Transfer::Scp(source) => source.fetch(name, dest).await,
            Transfer::Ftp(source) => source.fetch(name, dest).await,
        }
    }

    /// Fetch one manifest record below `home`, never failing
    ///
    /// Directory records resolve immediately without network access. On
    /// success the file's modified time is set from the record. On failure any
    /// partial file is removed and the outcome is the zero placeholder.
    pub async fn fetch_record(&self, home: &Path, record: &ManifestRecord) -> TransferOutcome {
        if record.is_dir() {
            return TransferOutcome::done(&record.path, 0, record.modified);
        }
        match self.fetch_into_home(home, record).await {
            Ok(bytes) => TransferOutcome::done(&record.path, bytes, record.modified),
            Err(e) => {
                warn!("Unable to pull '{}': {}", record.path, e);
                TransferOutcome::failed(&record.path, &e)
            }
        }
    }

    async fn fetch_into_home(&self, home: &Path, record: &ManifestRecord) -> Result<u64> {
        let dest = utils::resolve_key(home, &record.path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MimicError::filesystem(parent, e))?;
        }
        let bytes = match self.fetch(&record.path, &dest).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(e);
            }
        };
        utils::stamp(&dest, record.modified)?;
        Ok(bytes)
    }
}

impl HttpSource {
    async fn fetch(&self, name: &str, dest: &Path) -> Result<u64> {
        let url = utils::resource_url(&self.base, name)?;
        let mut response = self.client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(MimicError::transfer(name, response.status()));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| MimicError::filesystem(dest, e))?;
        let mut bytes = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(bytes)
    }
}

impl ScpSource {
    /// `[user@]host:path` argument for the remote side
    fn remote_spec(&self, name: &str) -> String {
        let base = if self.path.is_empty() { "." } else { self.path.as_str() };
        let path = utils::join_url(base, name);
        match &self.username {
            Some(user) => format!("{}@{}:{}", user, self.host, path),
            None => format!("{}:{}", self.host, path),
        }
    }

    async fn fetch(&self, name: &str, dest: &Path) -> Result<u64> {
        let mut command = Command::new("scp");
        command.args(["-B", "-q", "-o", "BatchMode=yes"]);
        if let Some(port) = self.port {
            command.arg("-P").arg(port.to_string());
        }
        if let Some(key) = &self.key_file {
            command.arg("-i").arg(key);
        }
        command.arg(self.remote_spec(name)).arg(dest);

        let output = command
            .output()
            .await
            .map_err(|e| MimicError::Scp(format!("unable to run scp: {}", e)))?;
        if !output.status.success() {
            return Err(MimicError::Scp(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(tokio::fs::metadata(dest).await?.len())
    }
}

impl FtpSource {
    async fn fetch(&self, name: &str, dest: &Path) -> Result<u64> {
        let source = self.clone();
        let remote = utils::join_url(&self.path, name);
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || source.retrieve(&remote, &dest)).await?
    }

    /// Blocking RETR streamed into `dest`
    fn retrieve(&self, remote: &str, dest: &Path) -> Result<u64> {
        let ftp_err = |e: FtpError| MimicError::Ftp(e.to_string());

        let mut ftp = FtpStream::connect((self.host.as_str(), self.port)).map_err(ftp_err)?;
        let (user, password) = match &self.username {
            Some(user) => (user.as_str(), self.password.as_deref().unwrap_or("")),
            None => ("anonymous", FTP_ANONYMOUS_PASSWORD),
        };
        ftp.login(user, password).map_err(ftp_err)?;
        ftp.transfer_type(FileType::Binary).map_err(ftp_err)?;

        let bytes = ftp
            .retr(remote, |reader| {
                let mut file = std::fs::File::create(dest).map_err(FtpError::ConnectionError)?;
                std::io::copy(reader, &mut file).map_err(FtpError::ConnectionError)
            })
            .map_err(ftp_err)?;

        if let Err(e) = ftp.quit() {
            debug!("FTP quit failed: {}", e);
        }
        Ok(bytes)
    }
}
