//! Session configuration values.
//!
//! Everything a command needs is carried in explicit structs handed to each
//! component's constructor: where the device is ([`DeviceEndpoint`]), how to
//! log into it ([`ShellCredentials`]) and the knobs that don't have a CLI
//! flag ([`Settings`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::control::DEFAULT_HTTP_TIMEOUT;
use crate::device::identity::{IdentityError, IdentityKey, discover_identities, load_identity};

pub const DEFAULT_HOST: &str = "192.168.15.244";
pub const DEFAULT_CONTROL_PORT: u16 = 8080;
pub const DEFAULT_SSH_USER: &str = "root";
pub const DEFAULT_DEPLOY_PATH: &str = "/mnt/us/koreader/plugins";

/// Default connect/handshake timeout for the SSH transport.
pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the companion REPL plugin is installed from when missing or stale.
pub const DEFAULT_REPL_PLUGIN_SOURCE: &str = "Consoleaf/repl.koplugin";

/// Oldest companion REPL plugin this client speaks to.
pub const DEFAULT_REPL_MIN_VERSION: &str = "0.1.0";

/// Address of the device's HTTP inspector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub host: String,
    pub control_port: u16,
}

impl DeviceEndpoint {
    pub fn new(host: impl Into<String>, control_port: u16) -> Self {
        Self {
            host: host.into(),
            control_port,
        }
    }

    /// Base URL every control path is appended to.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/koreader/", self.host, self.control_port)
    }
}

impl Default for DeviceEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_CONTROL_PORT)
    }
}

/// Login material for the device's SSH daemon.
#[derive(Clone)]
pub struct ShellCredentials {
    pub user: String,
    pub password: Option<String>,
    /// Keys to offer, in order: the explicit identity first, then discovered ones.
    pub identities: Vec<IdentityKey>,
    /// `None` until supplied by the user or obtained from the device.
    pub transport_port: Option<u16>,
}

impl ShellCredentials {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: None,
            identities: Vec::new(),
            transport_port: None,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    /// Set a known port. Zero is treated the same as unset.
    pub fn with_transport_port(mut self, port: Option<u16>) -> Self {
        self.transport_port = port.filter(|p| *p != 0);
        self
    }

    /// Load an explicitly requested identity file. Failure here is fatal.
    pub fn with_identity_file(mut self, path: &Path) -> Result<Self, IdentityError> {
        self.identities.push(load_identity(path)?);
        Ok(self)
    }

    /// Append every usable key found in `dir`, skipping anything unreadable.
    pub fn with_discovered_identities(mut self, dir: Option<&Path>) -> Self {
        if let Some(dir) = dir {
            self.identities.extend(discover_identities(dir));
        }
        self
    }

    pub fn password_or_empty(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

impl std::fmt::Debug for ShellCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellCredentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field(
                "identities",
                &self
                    .identities
                    .iter()
                    .map(|k| k.source.display().to_string())
                    .collect::<Vec<_>>(),
            )
            .field("transport_port", &self.transport_port)
            .finish()
    }
}

/// Settings without a dedicated flag, read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_timeout: Duration,
    pub ssh_timeout: Duration,
    pub repl_plugin_source: String,
    pub repl_min_version: String,
    pub skip_version_check: bool,
    /// Directory scanned for default SSH keys.
    pub key_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            ssh_timeout: DEFAULT_SSH_TIMEOUT,
            repl_plugin_source: DEFAULT_REPL_PLUGIN_SOURCE.to_string(),
            repl_min_version: DEFAULT_REPL_MIN_VERSION.to_string(),
            skip_version_check: false,
            key_dir: dirs::home_dir().map(|home| home.join(".ssh")),
        }
    }
}

impl Settings {
    /// Load settings from environment variables (and a `.env` file if present).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(val) = dotenvy::var("KOPL_HTTP_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            cfg.http_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = dotenvy::var("KOPL_SSH_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            cfg.ssh_timeout = Duration::from_millis(ms);
        }

        if let Ok(source) = dotenvy::var("KOPL_REPL_PLUGIN_SOURCE")
            && !source.trim().is_empty()
        {
            cfg.repl_plugin_source = source;
        }

        if let Ok(version) = dotenvy::var("KOPL_REPL_MIN_VERSION") {
            cfg.repl_min_version = version;
        }

        if let Ok(val) = dotenvy::var("KOPL_SKIP_VERSION_CHECK") {
            cfg.skip_version_check = val.eq_ignore_ascii_case("true") || val == "1";
        }

        cfg
    }
}
