//! Sync engine for pushing a local plugin tree onto the device.
//!
//! The engine walks the local tree depth-first and uploads as it goes; the walk
//! and the transfer are a single pass. Entries matching a [`SkipRule`] are
//! pruned together with their whole subtree.
//!
//! Remote paths are always built with forward slashes:
//! `{remote_parent}/{basename(local_root)}/{relative_path}`.
//!
//! # Safety
//!
//! The engine only creates and overwrites. Nothing on the remote side is
//! deleted, and a failed walk leaves whatever was already uploaded in place.
//!
//! # Example
//!
//! ```rust,ignore
//! use kopl::sync::{SkipRules, SyncEngine};
//!
//! let engine = SyncEngine::new(SkipRules::default());
//! let report = engine.sync(Path::new("hello.koplugin"), "/mnt/us/koreader/plugins", &sftp)?;
//! println!("uploaded {} files", report.files_transferred());
//! ```

use std::fmt;
use std::fs::{File, Metadata};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use thiserror::Error;
use walkdir::WalkDir;

/// Directory holding the vendored application checkout in plugin projects.
pub const VENDORED_DIR: &str = "koreader";

/// Marker prefix of hidden entries.
pub const HIDDEN_PREFIX: char = '.';

/// Errors that abort a sync.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("local path {} is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    #[error("failed to read local path {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open local file {}: {source}", path.display())]
    OpenLocal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create remote directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to create remote file {path}: {source}")]
    CreateFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to copy {} to {remote}: {source}", local.display())]
    Copy {
        local: PathBuf,
        remote: String,
        #[source]
        source: io::Error,
    },
}

/// Write access to the remote filesystem.
///
/// Paths are remote, forward-slash separated and absolute.
pub trait RemoteFs {
    type File: Write;

    /// Create `path` and any missing parents. Existing directories are fine.
    fn mkdir_all(&self, path: &str) -> io::Result<()>;

    /// Open `path` for writing, creating or truncating it.
    fn create(&self, path: &str) -> io::Result<Self::File>;

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()>;
}

/// A predicate pruning entries from a sync.
#[derive(Debug, Clone)]
pub enum SkipRule {
    /// Any entry whose name starts with [`HIDDEN_PREFIX`].
    Hidden,
    /// Directories with exactly this name.
    Directory(String),
    /// Files or directories whose name matches the glob.
    Pattern(glob::Pattern),
}

impl SkipRule {
    pub fn matches(&self, name: &str, is_dir: bool) -> bool {
        match self {
            Self::Hidden => name.starts_with(HIDDEN_PREFIX),
            Self::Directory(dir) => is_dir && name == dir,
            Self::Pattern(pattern) => pattern.matches(name),
        }
    }
}

impl fmt::Display for SkipRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hidden => write!(f, "hidden"),
            Self::Directory(dir) => write!(f, "directory {dir}/"),
            Self::Pattern(pattern) => write!(f, "pattern {}", pattern.as_str()),
        }
    }
}

/// Ordered set of skip rules. The first matching rule wins.
#[derive(Debug, Clone)]
pub struct SkipRules {
    rules: Vec<SkipRule>,
}

impl Default for SkipRules {
    /// Hidden entries and the vendored application directory.
    fn default() -> Self {
        Self {
            rules: vec![SkipRule::Hidden, SkipRule::Directory(VENDORED_DIR.to_string())],
        }
    }
}

impl SkipRules {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with(mut self, rule: SkipRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add a glob pattern rule.
    pub fn with_pattern(self, pattern: &str) -> Result<Self, glob::PatternError> {
        Ok(self.with(SkipRule::Pattern(glob::Pattern::new(pattern)?)))
    }

    pub fn matching(&self, name: &str, is_dir: bool) -> Option<&SkipRule> {
        self.rules.iter().find(|rule| rule.matches(name, is_dir))
    }

    pub fn rules(&self) -> &[SkipRule] {
        &self.rules
    }
}

/// One uploaded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncItem {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub is_dir: bool,
    /// Mode bits sent to the remote side (files only).
    pub permission_bits: Option<u32>,
}

/// Non-fatal failure to set a remote file's mode.
#[derive(Debug, Clone)]
pub struct PermissionWarning {
    pub remote_path: String,
    pub message: String,
}

/// Outcome of a completed sync.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub local_root: PathBuf,
    pub remote_root: String,
    /// Created directories and uploaded files, in walk order.
    pub transferred: Vec<SyncItem>,
    /// Relative paths pruned by a skip rule.
    pub skipped: Vec<PathBuf>,
    /// Relative paths of symlinks, devices and other non-regular entries.
    pub unsupported: Vec<PathBuf>,
    pub permission_warnings: Vec<PermissionWarning>,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(local_root: PathBuf, remote_root: String) -> Self {
        Self {
            local_root,
            remote_root,
            transferred: Vec::new(),
            skipped: Vec::new(),
            unsupported: Vec::new(),
            permission_warnings: Vec::new(),
            bytes_transferred: 0,
            duration_ms: 0,
        }
    }

    pub fn files_transferred(&self) -> usize {
        self.transferred.iter().filter(|item| !item.is_dir).count()
    }

    pub fn directories_created(&self) -> usize {
        self.transferred.iter().filter(|item| item.is_dir).count()
    }

    /// Transferred entries relative to the local root (the root itself is empty).
    pub fn relative_paths(&self) -> Vec<PathBuf> {
        self.transferred
            .iter()
            .filter_map(|item| item.local_path.strip_prefix(&self.local_root).ok())
            .map(Path::to_path_buf)
            .collect()
    }
}

/// Mirrors a local directory tree onto a [`RemoteFs`].
#[derive(Debug, Clone, Default)]
pub struct SyncEngine {
    rules: SkipRules,
}

impl SyncEngine {
    pub fn new(rules: SkipRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &SkipRules {
        &self.rules
    }

    /// Upload `local_root` into `remote_parent`.
    ///
    /// The root directory itself is never matched against skip rules.
    pub fn sync<F: RemoteFs>(
        &self,
        local_root: &Path,
        remote_parent: &str,
        fs: &F,
    ) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        let root = std::fs::canonicalize(local_root).map_err(|source| SyncError::Walk {
            path: local_root.to_path_buf(),
            source,
        })?;
        if !root.is_dir() {
            return Err(SyncError::NotADirectory { path: root });
        }

        // The name as given, so a symlinked plugin dir keeps its own name.
        let base = local_root
            .file_name()
            .or_else(|| root.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote_root = join_remote(remote_parent, &base);

        tracing::info!(
            local = %root.display(),
            remote = %remote_root,
            "starting upload"
        );

        let mut report = SyncReport::new(root.clone(), remote_root.clone());
        let mut walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(next) = walker.next() {
            let entry = next.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                SyncError::Walk {
                    path,
                    source: e.into(),
                }
            })?;

            let relative = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_path_buf();
            let file_type = entry.file_type();

            if entry.depth() > 0 {
                let name = entry.file_name().to_string_lossy();
                if let Some(rule) = self.rules.matching(&name, file_type.is_dir()) {
                    tracing::debug!(path = %relative.display(), rule = %rule, "skipping");
                    if file_type.is_dir() {
                        walker.skip_current_dir();
                    }
                    report.skipped.push(relative);
                    continue;
                }
            }

            let remote_path = remote_path_for(&remote_root, &relative);

            if file_type.is_dir() {
                fs.mkdir_all(&remote_path)
                    .map_err(|source| SyncError::CreateDir {
                        path: remote_path.clone(),
                        source,
                    })?;
                tracing::debug!(remote = %remote_path, "created remote directory");
                report.transferred.push(SyncItem {
                    local_path: entry.path().to_path_buf(),
                    remote_path,
                    is_dir: true,
                    permission_bits: None,
                });
            } else if file_type.is_file() {
                let item = upload_file(fs, entry.path(), &remote_path, &mut report)?;
                report.transferred.push(item);
            } else {
                tracing::info!(
                    path = %entry.path().display(),
                    file_type = ?file_type,
                    "skipping unsupported file type"
                );
                report.unsupported.push(relative);
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            files = report.files_transferred(),
            directories = report.directories_created(),
            bytes = report.bytes_transferred,
            skipped = report.skipped.len(),
            duration_ms = report.duration_ms,
            "upload completed"
        );
        Ok(report)
    }
}

fn upload_file<F: RemoteFs>(
    fs: &F,
    local: &Path,
    remote_path: &str,
    report: &mut SyncReport,
) -> Result<SyncItem, SyncError> {
    let mut local_file = File::open(local).map_err(|source| SyncError::OpenLocal {
        path: local.to_path_buf(),
        source,
    })?;

    let bytes = {
        let mut remote_file = fs
            .create(remote_path)
            .map_err(|source| SyncError::CreateFile {
                path: remote_path.to_string(),
                source,
            })?;
        let copy_err = |source| SyncError::Copy {
            local: local.to_path_buf(),
            remote: remote_path.to_string(),
            source,
        };
        let bytes = io::copy(&mut local_file, &mut remote_file).map_err(copy_err)?;
        remote_file.flush().map_err(copy_err)?;
        bytes
    };
    report.bytes_transferred += bytes;

    let mode = match local_file.metadata() {
        Ok(meta) => Some(permission_bits(&meta)),
        Err(e) => {
            warn_permissions(report, remote_path, format!("couldn't stat local file: {e}"));
            None
        }
    };
    if let Some(mode) = mode
        && let Err(e) = fs.chmod(remote_path, mode)
    {
        warn_permissions(report, remote_path, e.to_string());
    }

    tracing::info!(local = %local.display(), remote = %remote_path, bytes, "uploaded file");
    Ok(SyncItem {
        local_path: local.to_path_buf(),
        remote_path: remote_path.to_string(),
        is_dir: false,
        permission_bits: mode,
    })
}

fn warn_permissions(report: &mut SyncReport, remote_path: &str, message: String) {
    tracing::warn!(remote = %remote_path, error = %message, "failed to set permissions");
    report.permission_warnings.push(PermissionWarning {
        remote_path: remote_path.to_string(),
        message,
    });
}

#[cfg(unix)]
fn permission_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Join a remote directory and a single name with exactly one `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if name.is_empty() {
        return if dir.is_empty() { "/".to_string() } else { dir.to_string() };
    }
    format!("{dir}/{name}")
}

/// Remote path of `relative` below `remote_root`, using `/` on every platform.
pub fn remote_path_for(remote_root: &str, relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .fold(remote_root.to_string(), |acc, part| join_remote(&acc, &part))
}
