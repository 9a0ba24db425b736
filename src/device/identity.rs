//! SSH private key loading and discovery.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("couldn't read SSH identity file {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a PEM/OpenSSH private key", path.display())]
    NotAKey { path: PathBuf },
}

/// Private key material ready to hand to the SSH library.
#[derive(Clone)]
pub struct IdentityKey {
    pub source: PathBuf,
    pub pem: String,
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKey")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

fn looks_like_private_key(text: &str) -> bool {
    text.lines()
        .next()
        .map(|first| first.starts_with("-----BEGIN ") && first.contains("PRIVATE KEY-----"))
        .unwrap_or(false)
}

/// Load one identity file.
pub fn load_identity(path: &Path) -> Result<IdentityKey, IdentityError> {
    let pem = fs::read_to_string(path).map_err(|source| IdentityError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    if !looks_like_private_key(pem.trim_start()) {
        return Err(IdentityError::NotAKey {
            path: path.to_path_buf(),
        });
    }
    Ok(IdentityKey {
        source: path.to_path_buf(),
        pem,
    })
}

/// Collect every usable private key directly inside `dir`.
///
/// Subdirectories, unreadable files, public keys, `known_hosts` and anything
/// else that isn't a private key are skipped. Entries are returned sorted by
/// file name so the offer order is stable.
pub fn discover_identities(dir: &Path) -> Vec<IdentityKey> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "no key directory");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| match load_identity(&path) {
            Ok(key) => {
                debug!(key = %path.display(), "discovered identity");
                Some(key)
            }
            Err(e) => {
                debug!(error = %e, "skipping key candidate");
                None
            }
        })
        .collect()
}
