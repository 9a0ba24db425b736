//! Plugin deployment: bootstrap, upload, restore, restart.
//!
//! One deploy cycle runs strictly in this order:
//!
//! 1. negotiate SSH with the device (captures the passwordless setting),
//! 2. connect, upload the plugin tree over SFTP, close the session,
//! 3. restore the passwordless setting,
//! 4. stop the SSH daemon and restart the application so the new plugin code
//!    is loaded.
//!
//! Steps 3 and 4 also run when step 2 fails, and step 4 runs when step 1
//! fails after the daemon was started. Cleanup failures never hide the
//! original error.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_DEPLOY_PATH, ShellCredentials};
use crate::device::bootstrap::{SessionConnector, ShellSession, ShellSessionBootstrapper};
use crate::device::control::{ControlTransport, RemoteControlClient};
use crate::sync::{SkipRules, SyncEngine, SyncReport};
use crate::version_gate::PluginInstaller;

const GITHUB_BASE: &str = "https://github.com/";
const PLUGIN_SUFFIX: &str = ".koplugin";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{} is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    #[error("git is required to install plugins: {0}")]
    GitMissing(#[from] which::Error),

    #[error("git clone of {url} failed: {stderr}")]
    Clone { url: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the plugin files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    Local(PathBuf),
    /// Clone URL.
    Git(String),
}

impl PluginSource {
    /// Interpret a user-supplied repository reference.
    pub fn git(repo: &str) -> Self {
        Self::Git(normalize_repo(repo))
    }

    /// An existing local directory, otherwise a repository reference.
    pub fn parse(reference: &str) -> Self {
        let path = Path::new(reference);
        if path.is_dir() {
            Self::Local(path.to_path_buf())
        } else {
            Self::git(reference)
        }
    }

    /// Make the plugin tree available on local disk.
    pub fn fetch(&self) -> Result<FetchedPlugin, FetchError> {
        match self {
            Self::Local(path) => {
                if !path.is_dir() {
                    return Err(FetchError::NotADirectory { path: path.clone() });
                }
                Ok(FetchedPlugin {
                    path: path.clone(),
                    _checkout: None,
                })
            }
            Self::Git(url) => clone_repo(url),
        }
    }
}

impl fmt::Display for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Git(url) => f.write_str(url),
        }
    }
}

/// A plugin tree on local disk. Clones are deleted when this is dropped.
#[derive(Debug)]
pub struct FetchedPlugin {
    path: PathBuf,
    _checkout: Option<TempDir>,
}

impl FetchedPlugin {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Expand `owner/name` shorthand into a GitHub URL.
pub fn normalize_repo(repo: &str) -> String {
    let repo = repo.trim().trim_end_matches('/');
    if repo.contains("://") || repo.starts_with("git@") {
        return repo.to_string();
    }
    let shorthand = repo.trim_start_matches("github.com/");
    format!("{GITHUB_BASE}{shorthand}")
}

/// Local directory name for a clone; the device only loads `*.koplugin` dirs.
pub fn checkout_dir_name(url: &str) -> String {
    let base = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(url);
    let base = base.strip_suffix(".git").unwrap_or(base);
    if base.ends_with(PLUGIN_SUFFIX) {
        base.to_string()
    } else {
        format!("{base}{PLUGIN_SUFFIX}")
    }
}

fn clone_repo(url: &str) -> Result<FetchedPlugin, FetchError> {
    let git = which::which("git")?;
    let checkout = tempfile::Builder::new().prefix("kopl-").tempdir()?;
    let path = checkout.path().join(checkout_dir_name(url));

    info!(url, "cloning plugin repository");
    let output = Command::new(git)
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg("--")
        .arg(url)
        .arg(&path)
        .output()?;

    if !output.status.success() {
        return Err(FetchError::Clone {
            url: url.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    debug!(path = %path.display(), "clone complete");

    Ok(FetchedPlugin {
        path,
        _checkout: Some(checkout),
    })
}

/// Where and how plugins are uploaded.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Remote directory the plugin directory is created in.
    pub deploy_path: String,
    pub rules: SkipRules,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            deploy_path: DEFAULT_DEPLOY_PATH.to_string(),
            rules: SkipRules::default(),
        }
    }
}

/// Runs deploy cycles against one device.
pub struct Deployer<'a, T: ControlTransport, C: SessionConnector> {
    bootstrapper: ShellSessionBootstrapper<'a, T, C>,
    credentials: ShellCredentials,
    engine: SyncEngine,
    deploy_path: String,
}

impl<'a, T: ControlTransport, C: SessionConnector> Deployer<'a, T, C> {
    pub fn new(
        client: &'a RemoteControlClient<T>,
        connector: C,
        host: impl Into<String>,
        credentials: ShellCredentials,
        options: DeployOptions,
    ) -> Self {
        Self {
            bootstrapper: ShellSessionBootstrapper::new(client, connector, host),
            credentials,
            engine: SyncEngine::new(options.rules),
            deploy_path: options.deploy_path,
        }
    }

    /// Credentials in use, including any SSH port obtained from the device.
    pub fn credentials(&self) -> &ShellCredentials {
        &self.credentials
    }

    /// Upload `local_root` and restart the application.
    pub fn deploy(&mut self, local_root: &Path) -> Result<SyncReport> {
        let guard = match self.bootstrapper.negotiate(&mut self.credentials) {
            Ok(guard) => guard,
            Err(e) => {
                if self.bootstrapper.daemon_started()
                    && let Err(restart_err) = self.restart()
                {
                    warn!("cleanup after failed SSH setup: {restart_err:#}");
                }
                return Err(e).context("failed to prepare SSH on the device");
            }
        };

        let transfer = self.transfer(local_root);

        let restored = guard
            .restore()
            .context("failed to restore the device's passwordless SSH setting");
        let restarted = self.restart();

        match transfer {
            Ok(report) => {
                restored?;
                restarted?;
                info!(
                    files = report.files_transferred(),
                    bytes = report.bytes_transferred,
                    remote = %report.remote_root,
                    "plugin deployed"
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(restore_err) = restored {
                    warn!("cleanup after failed deploy: {restore_err:#}");
                }
                if let Err(restart_err) = restarted {
                    warn!("cleanup after failed deploy: {restart_err:#}");
                }
                Err(e)
            }
        }
    }

    /// Fetch `source` and deploy it.
    pub fn deploy_source(&mut self, source: &PluginSource) -> Result<SyncReport> {
        let fetched = source
            .fetch()
            .with_context(|| format!("failed to fetch plugin from {source}"))?;
        self.deploy(fetched.path())
    }

    fn transfer(&self, local_root: &Path) -> Result<SyncReport> {
        let session = self
            .bootstrapper
            .connect(&self.credentials)
            .context("failed to open SSH session")?;

        let result = session
            .filesystem()
            .context("failed to start SFTP")
            .and_then(|fs| {
                let report = self
                    .engine
                    .sync(local_root, &self.deploy_path, &fs)
                    .with_context(|| format!("failed to upload {}", local_root.display()));
                drop(fs);
                report
            });

        session.close();
        result
    }

    fn restart(&self) -> Result<()> {
        let client = self.bootstrapper.client();
        // The SSH daemon would otherwise inherit the inspector's listening socket.
        client
            .stop_shell_daemon()
            .context("failed to stop the SSH daemon before restart")?;
        client
            .restart_application()
            .context("failed to restart KOReader")?;
        info!("KOReader restarting");
        Ok(())
    }
}

impl<T: ControlTransport, C: SessionConnector> PluginInstaller for Deployer<'_, T, C> {
    fn install(&mut self, source: &PluginSource) -> Result<()> {
        self.deploy_source(source).map(drop)
    }
}
