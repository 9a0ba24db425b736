//! Talking to the reading device.
//!
//! # Architecture
//!
//! - **control**: blocking HTTP client for the KOReader HTTP inspector
//! - **bootstrap**: SSH daemon negotiation and the security-setting guard
//! - **identity**: private key loading and `~/.ssh` discovery
//! - **transport**: libssh2 sessions and the SFTP [`crate::sync::RemoteFs`]

pub mod bootstrap;
pub mod control;
pub mod identity;
pub mod transport;

pub use bootstrap::{
    BootstrapError, SecurityGuard, SessionConnector, ShellSession, ShellSessionBootstrapper,
};
pub use control::{ControlError, ControlTransport, HttpTransport, RemoteControlClient};
pub use identity::{IdentityError, IdentityKey, discover_identities, load_identity};
pub use transport::{SshConnector, SshSession};
