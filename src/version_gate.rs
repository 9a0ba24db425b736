//! Minimum-version check for companion plugins running on the device.
//!
//! The running application is asked for the plugin's `fullname` (present
//! only when the plugin is loaded) and then its `version`. Plugins that
//! predate version reporting, or report something that is not semver, are
//! treated as outdated and reinstalled.

use std::fmt;

use anyhow::{Context, Result};
use semver::Version;
use tracing::{debug, info};

use crate::deploy::PluginSource;
use crate::device::control::{ControlError, ControlTransport, RemoteControlClient};

/// UI module name the companion REPL plugin registers under.
pub const REPL_MODULE: &str = "Repl";

/// What the device reports about an installed plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstalledVersion {
    /// The plugin is not loaded at all.
    Absent,
    /// Loaded, but too old to report a version.
    Unversioned,
    Malformed(String),
    Present(Version),
}

impl InstalledVersion {
    pub fn satisfies(&self, minimum: &Version) -> bool {
        match self {
            Self::Present(version) => version >= minimum,
            _ => false,
        }
    }
}

impl fmt::Display for InstalledVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("not installed"),
            Self::Unversioned => f.write_str("unversioned"),
            Self::Malformed(raw) => write!(f, "unparseable version {raw:?}"),
            Self::Present(version) => write!(f, "{version}"),
        }
    }
}

/// Parse a version string, tolerating a leading `v`.
pub fn parse_version(raw: &str) -> Result<Version, semver::Error> {
    let trimmed = raw.trim();
    let bare = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    Version::parse(bare)
}

/// Installs (or overwrites) a plugin on the device.
pub trait PluginInstaller {
    fn install(&mut self, source: &PluginSource) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Installed version already meets the minimum.
    Current(Version),
    /// The plugin was (re)installed; the device restarts to load it.
    Installed { previous: InstalledVersion },
}

pub struct VersionGate<'a, T: ControlTransport> {
    client: &'a RemoteControlClient<T>,
}

impl<'a, T: ControlTransport> VersionGate<'a, T> {
    pub fn new(client: &'a RemoteControlClient<T>) -> Self {
        Self { client }
    }

    pub fn installed_version(&self, module: &str) -> Result<InstalledVersion, ControlError> {
        let Some(name) = self.client.plugin_field(module, "fullname")? else {
            return Ok(InstalledVersion::Absent);
        };
        debug!(module, name = %name, "plugin is loaded");

        Ok(match self.client.plugin_field(module, "version")? {
            None => InstalledVersion::Unversioned,
            Some(raw) => match parse_version(&raw) {
                Ok(version) => InstalledVersion::Present(version),
                Err(e) => {
                    debug!(module, raw = %raw, error = %e, "plugin version is not semver");
                    InstalledVersion::Malformed(raw)
                }
            },
        })
    }

    /// Install `source` unless `module` already reports at least `minimum`.
    pub fn ensure_minimum_version(
        &self,
        module: &str,
        minimum: &Version,
        source: &PluginSource,
        installer: &mut dyn PluginInstaller,
    ) -> Result<GateOutcome> {
        let installed = self
            .installed_version(module)
            .with_context(|| format!("failed to query the {module} plugin version"))?;

        if let InstalledVersion::Present(version) = &installed
            && version >= minimum
        {
            debug!(module, %version, %minimum, "plugin is current");
            return Ok(GateOutcome::Current(version.clone()));
        }

        info!(module, installed = %installed, %minimum, source = %source, "installing plugin");
        installer
            .install(source)
            .with_context(|| format!("failed to install {source}"))?;
        Ok(GateOutcome::Installed {
            previous: installed,
        })
    }
}
