//! SSH transport session and its SFTP filesystem.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use ssh2::{FileStat, Session, Sftp};
use tracing::debug;

use super::bootstrap::{BootstrapError, SessionConnector, ShellSession};
use crate::config::{DEFAULT_SSH_TIMEOUT, ShellCredentials};
use crate::sync::RemoteFs;

/// Opens authenticated SSH sessions with libssh2.
#[derive(Debug, Clone)]
pub struct SshConnector {
    timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(DEFAULT_SSH_TIMEOUT)
    }
}

impl SshConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn open_tcp(&self, host: &str, port: u16) -> Result<TcpStream, BootstrapError> {
        let addr = format!("{host}:{port}");
        let unreachable = |source| BootstrapError::Unreachable {
            addr: addr.clone(),
            source,
        };

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "host did not resolve");
        for candidate in (host, port).to_socket_addrs().map_err(unreachable)? {
            match TcpStream::connect_timeout(&candidate, self.timeout) {
                Ok(tcp) => {
                    tcp.set_read_timeout(Some(self.timeout)).ok();
                    tcp.set_write_timeout(Some(self.timeout)).ok();
                    return Ok(tcp);
                }
                Err(e) => last_err = e,
            }
        }
        Err(unreachable(last_err))
    }
}

impl SessionConnector for SshConnector {
    type Session = SshSession;

    fn connect(
        &self,
        host: &str,
        port: u16,
        creds: &ShellCredentials,
    ) -> Result<SshSession, BootstrapError> {
        debug!(host, port, user = %creds.user, "connecting over SSH");
        let addr = format!("{host}:{port}");
        let tcp = self.open_tcp(host, port)?;

        let handshake = |source| BootstrapError::Handshake {
            addr: addr.clone(),
            source,
        };
        let mut session = Session::new().map_err(handshake)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(handshake)?;

        let mut attempts = 1;
        if let Err(e) = session.userauth_password(&creds.user, creds.password_or_empty()) {
            debug!(error = %e, "password authentication rejected");
        }

        for key in &creds.identities {
            if session.authenticated() {
                break;
            }
            attempts += 1;
            if let Err(e) = session.userauth_pubkey_memory(&creds.user, None, &key.pem, None) {
                debug!(key = %key.source.display(), error = %e, "public key rejected");
            }
        }

        if !session.authenticated() {
            return Err(BootstrapError::AuthFailed {
                user: creds.user.clone(),
                attempts,
            });
        }

        debug!(host, port, "SSH session established");
        Ok(SshSession { session })
    }
}

/// An authenticated SSH session.
pub struct SshSession {
    session: Session,
}

impl ShellSession for SshSession {
    type Fs = Sftp;

    fn filesystem(&self) -> Result<Sftp, BootstrapError> {
        self.session
            .sftp()
            .map_err(|source| BootstrapError::Subsystem {
                name: "sftp",
                source: source.into(),
            })
    }

    fn close(self) {
        if let Err(e) = self.session.disconnect(None, "bye", None) {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

fn is_remote_dir(sftp: &Sftp, path: &Path) -> Option<bool> {
    sftp.stat(path).ok().map(|stat| stat.is_dir())
}

/// Every ancestor of `path` down to `path` itself, shortest first.
fn dir_prefixes(path: &str) -> Vec<String> {
    let mut current = if path.starts_with('/') {
        String::from("/")
    } else {
        String::new()
    };
    let mut prefixes = Vec::new();
    for part in path.split('/').filter(|part| !part.is_empty()) {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(part);
        prefixes.push(current.clone());
    }
    prefixes
}

impl RemoteFs for Sftp {
    type File = ssh2::File;

    fn mkdir_all(&self, path: &str) -> io::Result<()> {
        for current in dir_prefixes(path) {
            let dir = Path::new(&current);

            match is_remote_dir(self, dir) {
                Some(true) => continue,
                Some(false) => {
                    return Err(io::Error::other(format!("{current} exists and is not a directory")));
                }
                None => {}
            }
            if let Err(e) = self.mkdir(dir, 0o755) {
                // Lost a race or the server reports EEXIST oddly.
                if is_remote_dir(self, dir) != Some(true) {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn create(&self, path: &str) -> io::Result<ssh2::File> {
        Ok(Sftp::create(self, Path::new(path))?)
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };
        Ok(self.setstat(Path::new(path), stat)?)
    }
}
