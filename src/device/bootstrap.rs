//! Turning the HTTP control channel into an authenticated shell session.
//!
//! When no SSH port is known the device is asked to (re)start its SSH daemon
//! and to accept logins without a password for the duration of the operation.
//! The previous passwordless setting is captured in a [`SecurityGuard`]
//! before anything is changed; the guard puts it back exactly once, either
//! through [`SecurityGuard::restore`] or when it is dropped.
//!
//! ```text
//! Idle ──port supplied──────────────────────────────▶ Ready  (no-op guard)
//!   └──stop daemon → start daemon → read flag ──▶ Negotiating ──set flag──▶ Ready
//! ```

use std::cell::Cell;
use std::io;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::control::{ControlError, ControlTransport, RemoteControlClient};
use crate::config::ShellCredentials;
use crate::sync::RemoteFs;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("could not obtain a usable SSH port from the device (got {port})")]
    NegotiationFailed { port: u16 },

    #[error("SSH daemon unreachable at {addr}: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("SSH handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: ssh2::Error,
    },

    #[error("no credential accepted for user {user} ({attempts} methods tried)")]
    AuthFailed { user: String, attempts: usize },

    #[error("failed to open {name} channel: {source}")]
    Subsystem {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// An authenticated remote shell session.
pub trait ShellSession {
    type Fs: RemoteFs;

    /// Open the session's remote filesystem channel.
    fn filesystem(&self) -> Result<Self::Fs, BootstrapError>;

    fn close(self)
    where
        Self: Sized;
}

/// Opens [`ShellSession`]s.
pub trait SessionConnector {
    type Session: ShellSession;

    fn connect(
        &self,
        host: &str,
        port: u16,
        creds: &ShellCredentials,
    ) -> Result<Self::Session, BootstrapError>;
}

/// Puts the device's passwordless flag back the way it was found.
#[must_use = "dropping the guard restores the device's security setting immediately"]
pub struct SecurityGuard<'a, T: ControlTransport> {
    client: &'a RemoteControlClient<T>,
    /// `Some(previous)` while a restore is still owed.
    pending: Option<bool>,
}

impl<'a, T: ControlTransport> SecurityGuard<'a, T> {
    fn noop(client: &'a RemoteControlClient<T>) -> Self {
        Self {
            client,
            pending: None,
        }
    }

    fn restoring(client: &'a RemoteControlClient<T>, previous: bool) -> Self {
        Self {
            client,
            pending: Some(previous),
        }
    }

    /// Whether dropping or restoring this guard issues no request.
    pub fn is_noop(&self) -> bool {
        self.pending.is_none()
    }

    /// Restore the previous setting and report the result.
    pub fn restore(mut self) -> Result<(), ControlError> {
        self.restore_pending()
    }

    fn restore_pending(&mut self) -> Result<(), ControlError> {
        match self.pending.take() {
            Some(previous) => {
                debug!(allow = previous, "restoring passwordless SSH setting");
                self.client.set_passwordless(previous)
            }
            None => Ok(()),
        }
    }
}

impl<T: ControlTransport> Drop for SecurityGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.restore_pending() {
            warn!(error = %e, "failed to restore passwordless SSH setting");
        }
    }
}

/// Negotiates and opens SSH sessions to the device.
pub struct ShellSessionBootstrapper<'a, T: ControlTransport, C: SessionConnector> {
    client: &'a RemoteControlClient<T>,
    connector: C,
    host: String,
    daemon_started: Cell<bool>,
}

impl<'a, T: ControlTransport, C: SessionConnector> ShellSessionBootstrapper<'a, T, C> {
    pub fn new(client: &'a RemoteControlClient<T>, connector: C, host: impl Into<String>) -> Self {
        Self {
            client,
            connector,
            host: host.into(),
            daemon_started: Cell::new(false),
        }
    }

    /// Make sure an SSH daemon is listening and return the restore handle.
    ///
    /// A port already present in `creds` short-circuits everything. Otherwise
    /// the port handed out by the device is written back into `creds` so the
    /// rest of the process reuses it.
    pub fn negotiate(
        &self,
        creds: &mut ShellCredentials,
    ) -> Result<SecurityGuard<'a, T>, BootstrapError> {
        if let Some(port) = creds.transport_port {
            debug!(port, "SSH port supplied, skipping negotiation");
            return Ok(SecurityGuard::noop(self.client));
        }

        info!("SSH port not provided, starting SSH through the HTTP inspector");
        self.client.stop_shell_daemon()?;
        self.daemon_started.set(true);
        let port = self.client.start_shell_daemon()?;
        if port == 0 {
            return Err(BootstrapError::NegotiationFailed { port });
        }

        let allowed = self.client.passwordless_allowed()?;
        let guard = if allowed {
            SecurityGuard::noop(self.client)
        } else {
            let guard = SecurityGuard::restoring(self.client, allowed);
            self.client.set_passwordless(true)?;
            guard
        };

        creds.transport_port = Some(port);
        debug!(port, was_allowed = allowed, "SSH daemon ready");
        Ok(guard)
    }

    /// Open an authenticated session on the negotiated port.
    pub fn connect(&self, creds: &ShellCredentials) -> Result<C::Session, BootstrapError> {
        let port = creds
            .transport_port
            .filter(|port| *port != 0)
            .ok_or(BootstrapError::NegotiationFailed { port: 0 })?;
        self.connector.connect(&self.host, port, creds)
    }

    /// Whether `negotiate` asked the device to start its SSH daemon, even if
    /// negotiation failed afterwards.
    pub fn daemon_started(&self) -> bool {
        self.daemon_started.get()
    }

    pub fn client(&self) -> &'a RemoteControlClient<T> {
        self.client
    }
}
